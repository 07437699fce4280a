//! SMTP command and MIME multipart dissection.
//!
//! A byte-at-a-time state machine, one state and line buffer per direction.
//! All accumulation happens in the line buffer, which is what makes the
//! machine indifferent to how the stream was segmented. Unknown commands and
//! malformed headers never abort the session; the machine resumes at the
//! next CRLF.

use crate::classify::find_case;
use crate::fields::field;
use crate::{tls, Direction, Engine, Session};
use std::mem;

/// Lines longer than this stop accumulating; the tail of the line is
/// dropped.
const LINE_MAX: usize = 64 * 1024;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Cmd,
    CmdReturn,
    DataHeader,
    DataHeaderReturn,
    DataHeaderDone,
    Data,
    DataReturn,
    Ignore,
    TlsOk,
    TlsOkReturn,
    Tls,
    Mime,
    MimeReturn,
    MimeDone,
    MimeData,
    MimeDataReturn,
}

/// Streaming base64 decoder; carries sub-quad bit state across calls so that
/// arbitrary input splits decode bit-identically to a single-shot decode.
#[derive(Clone, Debug, Default)]
pub(crate) struct Base64Decoder {
    bits: u32,
    nbits: u8,
}

impl Base64Decoder {
    fn value(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    /// Decode another chunk, skipping padding and any non-alphabet bytes.
    pub(crate) fn update(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() / 4 * 3 + 2);
        for &c in input {
            let v = match Self::value(c) {
                Some(v) => v,
                None => continue,
            };
            self.bits = self.bits << 6 | u32::from(v);
            self.nbits += 6;
            if self.nbits >= 8 {
                self.nbits -= 8;
                out.push((self.bits >> self.nbits) as u8);
            }
        }
        out
    }
}

pub(crate) struct EmailState {
    state: [State; 2],
    line: [Vec<u8>; 2],
    /// MIME boundary stack, shared by both directions like the rest of the
    /// message framing.
    boundaries: Vec<Vec<u8>>,
    base64: [bool; 2],
    decoder: [Base64Decoder; 2],
    checksum: [md5::Context; 2],
}

impl EmailState {
    pub(crate) fn new() -> Self {
        Self {
            state: [State::Cmd; 2],
            line: [Vec::new(), Vec::new()],
            boundaries: Vec::new(),
            base64: [false; 2],
            decoder: [Base64Decoder::default(), Base64Decoder::default()],
            checksum: [md5::Context::new(), md5::Context::new()],
        }
    }
}

/// Skip whitespace, one optional `start` character, then take bytes up to
/// `stop` or the end.
fn remove_matching(mut s: &[u8], start: u8, stop: u8) -> &[u8] {
    while !s.is_empty() && s[0].is_ascii_whitespace() {
        s = &s[1..];
    }
    if !s.is_empty() && s[0] == start {
        s = &s[1..];
    }
    let end = s.iter().position(|&b| b == stop).unwrap_or(s.len());
    &s[..end]
}

fn lower(s: &[u8]) -> String {
    String::from_utf8_lossy(&s.to_ascii_lowercase()).into_owned()
}

/// Tolerant address-list parse: optional quoted display name, optional
/// `<addr>`, comma separators. Every address is lower-cased and added to the
/// (deduplicating) field.
fn parse_addresses(engine: &Engine, session: &mut Session, id: crate::FieldId, data: &[u8]) {
    let end = data.len();
    let mut i = 0;

    while i < end {
        while i < end && data[i].is_ascii_whitespace() {
            i += 1;
        }
        let mut start = i;

        if i < end && data[i] == b'"' {
            i += 1;
            while i < end && data[i] != b'"' {
                i += 1;
            }
            i += 1;
            while i < end && data[i].is_ascii_whitespace() {
                i += 1;
            }
            start = i;
        }

        while i < end && data[i] != b'<' && data[i] != b',' {
            i += 1;
        }

        if i < end && data[i] == b'<' {
            i += 1;
            start = i;
            while i < end && data[i] != b'>' {
                i += 1;
            }
        }

        if i > start {
            session
                .fields
                .add_string(&engine.registry, id, lower(&data[start.min(end)..i.min(end)]));
        }

        while i < end && data[i] != b',' {
            i += 1;
        }
        if i < end {
            i += 1;
        }
    }
}

/// One mail header line from the DATA section.
fn parse_data_header(engine: &Engine, session: &mut Session, email: &mut EmailState, dir: Direction, line: &[u8]) {
    let reg = &engine.registry;

    let colon = match line.iter().position(|&b| b == b':') {
        Some(colon) => colon,
        None => return,
    };
    let name = lower(&line[..colon]);
    let value = &line[colon + 1..];

    if let Some(&id) = engine.email_headers.get(&name) {
        engine.add_routed_value(session, id, value);
    } else if name == "cc" || name == "to" {
        parse_addresses(engine, session, field::EMAIL_DST, value);
    } else if name == "from" {
        parse_addresses(engine, session, field::EMAIL_SRC, value);
    } else if name == "message-id" {
        let id = remove_matching(value, b'<', b'>');
        session
            .fields
            .add_string(reg, field::EMAIL_ID, String::from_utf8_lossy(id).into_owned());
    } else if name == "content-type" {
        let ct = crate::trim_start(value);
        session
            .fields
            .add_string(reg, field::EMAIL_CT, String::from_utf8_lossy(ct).into_owned());
        if let Some(pos) = find_case(ct, b"boundary=") {
            let boundary = remove_matching(&ct[pos + 9..], b'"', b'"');
            email.boundaries.push(boundary.to_vec());
        }
    } else {
        for header in &engine.config.smtp_ip_headers {
            if name == *header {
                let ip = remove_matching(value, b'[', b']');
                if let Some(wire) = crate::parse_ipv4_wire(ip) {
                    session.fields.add_int(reg, field::EMAIL_IP, wire);
                }
                break;
            }
        }
    }

    engine.hooks.smtp_header(session, dir, &name, value);
}

/// One MIME part header line.
fn parse_mime_header(engine: &Engine, session: &mut Session, email: &mut EmailState, dir: Direction, line: &[u8]) {
    let reg = &engine.registry;
    let d = dir.index();

    if line.len() >= 13 && line[..13].eq_ignore_ascii_case(b"content-type:") {
        let s = crate::trim_start(&line[13..]);
        if let Some(pos) = find_case(s, b"boundary=") {
            let boundary = remove_matching(&s[pos + 9..], b'"', b'"');
            email.boundaries.push(boundary.to_vec());
        }
    } else if line.len() >= 20 && line[..20].eq_ignore_ascii_case(b"content-disposition:") {
        let s = crate::trim_start(&line[13..]);
        if let Some(pos) = find_case(s, b"filename=") {
            let filename = remove_matching(&s[pos + 9..], b'"', b'"');
            session.fields.add_string(
                reg,
                field::EMAIL_FN,
                String::from_utf8_lossy(filename).into_owned(),
            );
        }
    } else if line.len() >= 26 && line[..26].eq_ignore_ascii_case(b"content-transfer-encoding:")
        && find_case(&line[26..], b"base64").is_some()
    {
        email.base64[d] = true;
    }
}

fn push_line(line: &mut Vec<u8>, c: u8) {
    if line.len() < LINE_MAX {
        line.push(c);
    }
}

/// Does the line start a known multipart boundary (`--<boundary>`)?
fn matches_boundary(boundaries: &[Vec<u8>], line: &[u8]) -> bool {
    if line.first() != Some(&b'-') {
        return false;
    }
    boundaries
        .iter()
        .any(|b| line.len() >= b.len() + 2 && &line[2..2 + b.len()] == &b[..])
}

pub(crate) fn parse(engine: &Engine, session: &mut Session, dir: Direction, bytes: &[u8]) {
    let mut email = match session.email.take() {
        Some(email) => email,
        None => return,
    };
    if run(engine, session, &mut email, dir, bytes) {
        session.email = Some(email);
    }
}

/// Returns false when the email state should be destroyed (STARTTLS
/// completed and the stream switched to TLS).
fn run(
    engine: &Engine,
    session: &mut Session,
    email: &mut EmailState,
    dir: Direction,
    bytes: &[u8],
) -> bool {
    let reg = &engine.registry;
    let d = dir.index();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        match email.state[d] {
            State::Cmd => {
                if c == b'\r' {
                    email.state[d] = State::CmdReturn;
                } else {
                    push_line(&mut email.line[d], c);
                }
            }
            State::CmdReturn => {
                let line = mem::replace(&mut email.line[d], Vec::new());
                if line.len() >= 10 && line[..10].eq_ignore_ascii_case(b"MAIL FROM:") {
                    email.state[d] = State::Cmd;
                    let addr = remove_matching(line.get(11..).unwrap_or(b""), b'<', b'>');
                    session.fields.add_string(reg, field::EMAIL_SRC, lower(addr));
                } else if line.len() >= 8 && line[..8].eq_ignore_ascii_case(b"RCPT TO:") {
                    email.state[d] = State::Cmd;
                    let addr = remove_matching(line.get(9..).unwrap_or(b""), b'<', b'>');
                    session.fields.add_string(reg, field::EMAIL_DST, lower(addr));
                } else if line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"DATA") {
                    email.state[d] = State::DataHeader;
                } else if line.len() >= 8 && line[..8].eq_ignore_ascii_case(b"STARTTLS") {
                    email.state[d] = State::Ignore;
                    email.state[dir.other().index()] = State::TlsOk;
                    return true;
                } else {
                    email.state[d] = State::Cmd;
                }
                if c != b'\n' {
                    continue;
                }
            }
            State::DataHeader => {
                if c == b'\r' {
                    email.state[d] = State::DataHeaderReturn;
                } else {
                    push_line(&mut email.line[d], c);
                }
            }
            State::DataHeaderReturn => {
                if email.line[d] == b"." {
                    email.state[d] = State::Cmd;
                    email.line[d].clear();
                } else if email.line[d].is_empty() {
                    email.state[d] = State::Data;
                    engine.hooks.smtp_headers_complete(session, dir);
                } else {
                    email.state[d] = State::DataHeaderDone;
                }
                if c != b'\n' {
                    continue;
                }
            }
            State::DataHeaderDone => {
                email.state[d] = State::DataHeader;

                if c == b' ' || c == b'\t' {
                    // Folded continuation, keep accumulating the same header
                    push_line(&mut email.line[d], c);
                } else {
                    let line = mem::replace(&mut email.line[d], Vec::new());
                    parse_data_header(engine, session, email, dir, &line);
                    if c != b'\n' {
                        continue;
                    }
                }
            }
            State::Data | State::MimeData => {
                if c == b'\r' {
                    email.state[d] = if email.state[d] == State::Data {
                        State::DataReturn
                    } else {
                        State::MimeDataReturn
                    };
                } else {
                    push_line(&mut email.line[d], c);
                }
            }
            State::DataReturn | State::MimeDataReturn => {
                let was_mime = email.state[d] == State::MimeDataReturn;
                let line = mem::replace(&mut email.line[d], Vec::new());

                if line == b"." {
                    email.state[d] = State::Cmd;
                } else if matches_boundary(&email.boundaries, &line) {
                    if email.base64[d] {
                        let digest =
                            mem::replace(&mut email.checksum[d], md5::Context::new()).compute();
                        session
                            .fields
                            .add_string(reg, field::EMAIL_MD5, format!("{:x}", digest));
                    }
                    email.base64[d] = false;
                    email.decoder[d] = Base64Decoder::default();
                    email.checksum[d] = md5::Context::new();
                    email.state[d] = State::Mime;
                } else if was_mime {
                    if email.base64[d] {
                        let decoded = email.decoder[d].update(&line);
                        email.checksum[d].consume(&decoded);
                    }
                    email.state[d] = State::MimeData;
                } else {
                    email.state[d] = State::Data;
                }

                if c != b'\n' {
                    continue;
                }
            }
            State::Ignore => {
                return true;
            }
            State::TlsOk => {
                if c == b'\r' {
                    email.state[d] = State::TlsOkReturn;
                } else {
                    push_line(&mut email.line[d], c);
                }
            }
            State::TlsOkReturn => {
                email.state[d] = State::Tls;
                email.line[d].clear();
                if c != b'\n' {
                    continue;
                }
            }
            State::Tls => {
                // The handshake follows immediately; hand the rest of this
                // chunk to the TLS dissector and drop the email state.
                email.state[d] = State::Ignore;
                tls::process(session, &bytes[i..]);
                return false;
            }
            State::Mime => {
                if c == b'\r' {
                    email.state[d] = State::MimeReturn;
                } else {
                    push_line(&mut email.line[d], c);
                }
            }
            State::MimeReturn => {
                if email.line[d].is_empty() {
                    email.state[d] = State::MimeData;
                } else {
                    email.state[d] = State::MimeDone;
                }
                if c != b'\n' {
                    continue;
                }
            }
            State::MimeDone => {
                email.state[d] = State::Mime;

                if c == b' ' || c == b'\t' {
                    push_line(&mut email.line[d], c);
                } else {
                    let line = mem::replace(&mut email.line[d], Vec::new());
                    parse_mime_header(engine, session, email, dir, &line);
                    if c != b'\n' {
                        continue;
                    }
                }
            }
        }

        i += 1;
    }

    true
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remove_matching() {
        assert_eq!(b"a@b", remove_matching(b"<a@b>", b'<', b'>'));
        assert_eq!(b"a@b", remove_matching(b"  <a@b>", b'<', b'>'));
        assert_eq!(b"a@b", remove_matching(b"a@b", b'<', b'>'));
        assert_eq!(b"BND", remove_matching(b"\"BND\"; x", b'"', b'"'));
        assert_eq!(b"", remove_matching(b"", b'<', b'>'));
    }

    #[test]
    fn test_base64_incremental_matches_single_shot() {
        let plain = b"The quick brown fox jumps over the lazy dog, 3 times.";
        let encoded = base64::encode(&plain[..]);

        let mut single = Base64Decoder::default();
        let whole = single.update(encoded.as_bytes());
        assert_eq!(&plain[..], &whole[..]);

        for split in 1..encoded.len() {
            let mut dec = Base64Decoder::default();
            let mut out = Vec::new();
            for chunk in encoded.as_bytes().chunks(split) {
                out.extend_from_slice(&dec.update(chunk));
            }
            assert_eq!(&plain[..], &out[..], "split size {}", split);
        }
    }

    #[test]
    fn test_base64_skips_padding_and_noise() {
        let mut dec = Base64Decoder::default();
        let out = dec.update(b"aGV=\r\n");
        assert_eq!(b"he", &out[..]);
    }

    #[test]
    fn test_boundary_match() {
        let boundaries = vec![b"BND".to_vec()];
        assert!(matches_boundary(&boundaries, b"--BND"));
        assert!(matches_boundary(&boundaries, b"--BND--"));
        assert!(!matches_boundary(&boundaries, b"-BND"));
        assert!(!matches_boundary(&boundaries, b"--BN"));
        assert!(!matches_boundary(&boundaries, b"BND"));
    }

    #[test]
    fn test_parse_addresses() {
        use crate::{Engine, EngineConfig, FieldValue, FiveTuple};

        let engine = Engine::new(EngineConfig::default());
        let mut s = engine.new_session(FiveTuple::tcp(
            "10.0.0.1".parse().unwrap(),
            50000,
            "10.0.0.2".parse().unwrap(),
            25,
        ));

        parse_addresses(
            &engine,
            &mut s,
            field::EMAIL_DST,
            b" \"Some One\" <One@Example.COM>, two@example.org , one@example.com",
        );

        assert_eq!(
            Some(&FieldValue::StrHash(vec![
                "one@example.com".to_string(),
                "two@example.org ".to_string(),
            ])),
            s.fields.get(field::EMAIL_DST)
        );
    }
}
