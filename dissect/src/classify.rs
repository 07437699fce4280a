//! First-bytes protocol classification.
//!
//! Runs on every half-stream callback while the stream offset is still 0,
//! over the accumulated head of the stream. Classification is additive: a
//! flow can collect several protocol tags, and matching a signature may
//! install per-session dissector state (SSH banner, email state, TLS).

use crate::fields::field;
use crate::{smtp, tls, Direction, Engine, Session};
use std::mem;

/// Byte-wise substring search.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Case-insensitive substring search.
pub(crate) fn find_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

pub(crate) fn classify(engine: &Engine, session: &mut Session, dir: Direction, new_len: usize) {
    let data = mem::replace(&mut session.classify_buf[dir.index()], Vec::new());
    run(engine, session, &data, new_len);
    session.classify_buf[dir.index()] = data;
}

fn run(engine: &Engine, session: &mut Session, data: &[u8], new_len: usize) {
    let reg = &engine.registry;
    let count = data.len();

    if count < 3 {
        return;
    }

    if &data[..3] == b"SSH" {
        session.is_ssh = true;
        session.fields.add_tag(reg, "protocol:ssh");
        if let Some(nl) = data.iter().position(|&b| b == b'\n') {
            let end = if nl > 0 && data[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };
            let banner = String::from_utf8_lossy(&data[..end].to_ascii_lowercase()).into_owned();
            session.fields.add_string(reg, field::SSH_VER, banner);
        }
    }

    if count < 4 {
        return;
    }

    if &data[..4] == b"220 " {
        if find(data, b"LMTP").is_some() {
            session.fields.add_tag(reg, "protocol:lmtp");
        } else if find(data, b"SMTP").is_some() {
            session.fields.add_tag(reg, "protocol:smtp");
            if session.email.is_none() {
                session.email = Some(Box::new(smtp::EmailState::new()));
            }
        } else {
            session.fields.add_tag(reg, "protocol:ftp");
        }
    }

    if count < 5 {
        return;
    }

    if &data[..5] == b"HELO " || &data[..5] == b"EHLO " {
        session.fields.add_tag(reg, "protocol:smtp");
        if session.email.is_none() {
            session.email = Some(Box::new(smtp::EmailState::new()));
        }
    }

    if count < 9 {
        return;
    }

    if (data[4] == 0xff || data[4] == 0xfe) && &data[5..8] == b"SMB" {
        session.fields.add_tag(reg, "protocol:smb");
    }

    if &data[..9] == b"+OK POP3 " {
        session.fields.add_tag(reg, "protocol:pop3");
    }

    if count < 11 {
        return;
    }

    if (data[0] == b':' && find(data, b" NOTICE ").is_some())
        || data.starts_with(b"NOTICE AUTH")
        || data.starts_with(b"NICK ")
        || data.starts_with(b"PASS ")
    {
        session.fields.add_tag(reg, "protocol:irc");
        session.is_irc = true;
    }

    if count < 14 {
        return;
    }

    // gh0st RAT: 5-byte magic, compressed length at a platform-dependent
    // offset, zlib header 0x78 at byte 13
    let le_len = usize::from(data[6]) << 8 | usize::from(data[5]);
    let be_len = usize::from(data[7]) << 8 | usize::from(data[8]);
    if data[13] == 0x78
        && ((data[8] == 0 && data[7] == 0 && le_len == count)
            || (data[5] == 0 && data[6] == 0 && be_len == count))
    {
        session.fields.add_tag(reg, "protocol:gh0st");
    } else if count >= 15
        && data[7] == 0
        && data[8] == 0
        && data[11] == 0
        && data[12] == 0
        && data[13] == 0x78
        && data[14] == 0x9c
    {
        session.fields.add_tag(reg, "protocol:gh0st-improved");
    }

    if count < 19 {
        return;
    }

    if &data[..19] == b"BitTorrent protocol" {
        session.fields.add_tag(reg, "protocol:bittorrent");
    }

    if count < 30 {
        return;
    }

    // Server certificate flight: TLS record header with a ServerHello
    // handshake. Only once the head spans more than one segment, and then on
    // every later callback; certificate dedup absorbs the re-parses.
    if count != new_len
        && data[0] == 0x16
        && data[1] == 0x03
        && data[2] <= 0x03
        && data[5] == 2
    {
        session.fields.add_tag(reg, "protocol:tls");
        tls::process(session, data);
    }
}
