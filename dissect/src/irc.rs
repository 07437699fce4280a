//! IRC line sniffing: JOIN channels and NICK names.

use crate::fields::field;
use crate::{Direction, Engine, Session};

fn token(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .position(|&b| b == b' ' || b == b'\r' || b == b'\n')
        .unwrap_or(data.len());
    &data[..end]
}

pub(crate) fn parse(engine: &Engine, session: &mut Session, _dir: Direction, bytes: &[u8]) {
    let reg = &engine.registry;
    let mut data = bytes;

    while !data.is_empty() {
        // Skip the remainder of a line whose prefix was already inspected
        if session.irc_midline {
            match data.iter().position(|&b| b == b'\n') {
                Some(nl) => {
                    data = &data[nl + 1..];
                    session.irc_midline = false;
                }
                None => return,
            }
        }
        if data.is_empty() {
            return;
        }

        if data.len() > 5 && &data[..5] == b"JOIN " {
            session.fields.add_string(
                reg,
                field::IRC_CHANNELS,
                String::from_utf8_lossy(token(&data[5..])).into_owned(),
            );
        }
        if data.len() > 5 && &data[..5] == b"NICK " {
            session.fields.add_string(
                reg,
                field::IRC_NICK,
                String::from_utf8_lossy(token(&data[5..])).into_owned(),
            );
        }

        session.irc_midline = true;
    }
}
