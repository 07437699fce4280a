//! SSH binary-phase dissection: walk the length-prefixed packet stream until
//! a key-exchange reply (code 33) yields the host key.

use crate::fields::field;
use crate::{Direction, Engine, Session};

pub(crate) fn parse(engine: &Engine, session: &mut Session, _dir: Direction, bytes: &[u8]) {
    // Banner lines are handled by the classifier
    if bytes.len() >= 3 && &bytes[..3] == b"SSH" {
        return;
    }

    let mut data = bytes;
    loop {
        // Finish skipping a packet left over from the previous segment
        if session.ssh_remaining > 0 {
            let skip = session.ssh_remaining.min(data.len());
            session.ssh_remaining -= skip;
            data = &data[skip..];
        }

        if data.len() < 6 {
            return;
        }

        let len = u32::from(data[0]) << 24
            | u32::from(data[1]) << 16
            | u32::from(data[2]) << 8
            | u32::from(data[3]);
        if len == 0 {
            return;
        }
        let total = len as usize + 4;
        let code = data[5];

        if code == 33 && data.len() > 8 {
            // Key exchange reply carrying the host key. Whether or not the
            // key is fully buffered, SSH parsing is done for this session.
            session.is_ssh = false;
            if data.len() >= 10 {
                let keylen = u32::from(data[6]) << 24
                    | u32::from(data[7]) << 16
                    | u32::from(data[8]) << 8
                    | u32::from(data[9]);
                let keylen = keylen as usize;
                if data.len() >= 10 + keylen {
                    session.fields.add_string(
                        &engine.registry,
                        field::SSH_KEY,
                        base64::encode(&data[10..10 + keylen]),
                    );
                }
            }
            return;
        }

        if data.len() > total {
            data = &data[total..];
        } else {
            session.ssh_remaining = total - data.len();
            return;
        }
    }
}
