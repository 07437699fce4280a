//! DNS datagram dissection: question names, qtype/qclass tags, and A/CNAME
//! answers.

use crate::bsb::{Bsb, BsbMut};
use crate::fields::field;
use crate::{Engine, Session};

/// Decoded names are clipped to this many bytes.
const NAME_BUFFER: usize = 8000;

fn qclass_tag(qclass: u16) -> Option<&'static str> {
    Some(match qclass {
        1 => "dns:qclass:IN",
        2 => "dns:qclass:CS",
        3 => "dns:qclass:CH",
        4 => "dns:qclass:HS",
        255 => "dns:qclass:ANY",
        _ => return None,
    })
}

fn qtype_tag(qtype: u16) -> Option<&'static str> {
    Some(match qtype {
        1 => "dns:qtype:A",
        2 => "dns:qtype:NS",
        3 => "dns:qtype:MD",
        4 => "dns:qtype:MF",
        5 => "dns:qtype:CNAME",
        6 => "dns:qtype:SOA",
        7 => "dns:qtype:MB",
        8 => "dns:qtype:MG",
        9 => "dns:qtype:MR",
        10 => "dns:qtype:NULL",
        11 => "dns:qtype:WKS",
        12 => "dns:qtype:PTR",
        13 => "dns:qtype:HINFO",
        14 => "dns:qtype:MINFO",
        15 => "dns:qtype:MX",
        16 => "dns:qtype:TXT",
        252 => "dns:qtype:AXFR",
        253 => "dns:qtype:MAILB",
        254 => "dns:qtype:MAILA",
        255 => "dns:qtype:ANY",
        _ => return None,
    })
}

/// Append one label, sanitizing every byte: non-ASCII renders as `M-x`,
/// non-printable as `^x`. Returns true when the label is terminal or
/// truncated.
fn name_element(nbsb: &mut BsbMut<'_>, bsb: &mut Bsb<'_>) -> bool {
    let nlen = usize::from(bsb.import_u8());

    if nlen == 0 || nlen > bsb.remaining() {
        return true;
    }

    for _ in 0..nlen {
        let mut c = bsb.import_u8();

        if !c.is_ascii() {
            nbsb.export_u8(b'M');
            nbsb.export_u8(b'-');
            c &= 0x7f;
        }
        if !(0x20..=0x7e).contains(&c) {
            nbsb.export_u8(b'^');
            c ^= 0x40;
        }

        nbsb.export_u8(c);
    }

    false
}

/// Read a possibly compressed name.
///
/// `full` is the whole message, needed to chase compression pointers. The
/// pointer-chain depth is capped at 6; exceeding it returns `None`.
fn decode_name<'a>(full: &'a [u8], inbsb: &mut Bsb<'a>) -> Option<String> {
    let mut buf = [0u8; NAME_BUFFER];
    let mut nbsb = BsbMut::new(&mut buf);
    let mut pointers = 0;
    let mut jumped: Option<Bsb<'a>> = None;

    loop {
        let cur = match jumped.as_mut() {
            Some(tmp) => tmp,
            None => &mut *inbsb,
        };
        if cur.remaining() == 0 {
            break;
        }

        let ch = cur.import_u8();
        if ch == 0 {
            break;
        }
        cur.rewind(1);

        if ch & 0xc0 == 0xc0 {
            if pointers > 5 {
                return None;
            }
            pointers += 1;
            let tpos = usize::from(cur.import_u16() & 0x3fff);
            jumped = Some(Bsb::new(full.get(tpos..).unwrap_or(&[])));
            continue;
        }

        if nbsb.len() > 0 {
            nbsb.export_u8(b'.');
        }
        if name_element(&mut nbsb, cur) && nbsb.len() > 0 {
            // Drop the separator written for the failed label
            nbsb.rewind(1);
        }
    }

    Some(String::from_utf8_lossy(nbsb.written()).into_owned())
}

pub(crate) fn parse(engine: &Engine, session: &mut Session, data: &[u8]) {
    let reg = &engine.registry;

    if data.len() < 18 {
        return;
    }

    let qr = data[2] >> 7 & 0x1;
    let opcode = data[2] >> 3 & 0xf;
    if opcode != 0 {
        return;
    }

    let qdcount = usize::from(data[4]) << 8 | usize::from(data[5]);
    let ancount = usize::from(data[6]) << 8 | usize::from(data[7]);
    if qdcount > 10 || qdcount == 0 {
        return;
    }

    let mut bsb = Bsb::new(&data[12..]);

    for _ in 0..qdcount {
        if bsb.is_error() {
            break;
        }
        let name = match decode_name(data, &mut bsb) {
            Some(name) => name,
            None => break,
        };
        if name.is_empty() || bsb.is_error() {
            break;
        }

        let qtype = bsb.import_u16();
        let qclass = bsb.import_u16();

        if let Some(tag) = qclass_tag(qclass) {
            session.fields.add_tag(reg, tag);
        }
        if let Some(tag) = qtype_tag(qtype) {
            session.fields.add_tag(reg, tag);
        }
        session
            .fields
            .add_string(reg, field::DNS_HOST, name.to_ascii_lowercase());
    }
    session.fields.add_tag(reg, "protocol:dns");

    if qr == 0 {
        return;
    }

    for _ in 0..ancount {
        if bsb.is_error() {
            break;
        }
        decode_name(data, &mut bsb);
        if bsb.is_error() {
            break;
        }

        let antype = bsb.import_u16();
        let anclass = bsb.import_u16();
        bsb.skip(4); // ttl
        let rdlength = usize::from(bsb.import_u16());

        if antype == 1 && anclass == 1 && rdlength == 4 && bsb.remaining() >= 4 {
            let p = bsb.work_slice();
            let addr = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
            session.fields.add_int(reg, field::DNS_IP, addr);
        } else if antype == 5 && anclass == 1 && bsb.remaining() >= rdlength {
            let mut rdbsb = Bsb::new(&bsb.work_slice()[..rdlength]);
            if let Some(name) = decode_name(data, &mut rdbsb) {
                if !name.is_empty() && !rdbsb.is_error() {
                    session
                        .fields
                        .add_string(reg, field::DNS_HOST, name.to_ascii_lowercase());
                }
            }
        }
        bsb.skip(rdlength);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{EngineConfig, FieldValue, FiveTuple};
    use pretty_assertions::assert_eq;

    fn dns_session(engine: &Engine) -> Session {
        engine.new_session(FiveTuple::udp(
            "10.0.0.1".parse().unwrap(),
            50000,
            "10.0.0.53".parse().unwrap(),
            53,
        ))
    }

    fn labels(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    fn query(name: &str, qtype: u16, qclass: u16) -> Vec<u8> {
        let mut msg = vec![
            0x12, 0x34, // id
            0x00, 0x00, // flags: QR=0 opcode=0
            0x00, 0x01, // qdcount
            0x00, 0x00, // ancount
            0x00, 0x00, 0x00, 0x00, // ns/ar
        ];
        msg.extend_from_slice(&labels(name));
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&qclass.to_be_bytes());
        msg
    }

    #[test]
    fn test_a_query() {
        let engine = Engine::new(EngineConfig::default());
        let mut s = dns_session(&engine);
        engine.on_datagram(&mut s, &query("example.com", 1, 1));

        assert!(s.fields.has_tag("protocol:dns"));
        assert!(s.fields.has_tag("dns:qtype:A"));
        assert!(s.fields.has_tag("dns:qclass:IN"));
        assert_eq!(
            Some(&FieldValue::StrHash(vec!["example.com".to_string()])),
            s.fields.get(field::DNS_HOST)
        );
    }

    #[test]
    fn test_zero_qdcount_is_ignored() {
        let engine = Engine::new(EngineConfig::default());
        let mut s = dns_session(&engine);
        let mut msg = query("example.com", 1, 1);
        msg[5] = 0;
        let before = engine.document(&s);
        engine.on_datagram(&mut s, &msg);
        assert_eq!(before, engine.document(&s));
    }

    #[test]
    fn test_large_qdcount_is_ignored() {
        let engine = Engine::new(EngineConfig::default());
        let mut s = dns_session(&engine);
        let mut msg = query("example.com", 1, 1);
        msg[5] = 11;
        engine.on_datagram(&mut s, &msg);
        assert!(!s.fields.has_tag("protocol:dns"));
    }

    #[test]
    fn test_response_with_a_and_cname() {
        let engine = Engine::new(EngineConfig::default());
        let mut s = dns_session(&engine);

        let mut msg = vec![
            0x12, 0x34, 0x80, 0x00, // QR=1
            0x00, 0x01, 0x00, 0x02, // one question, two answers
            0x00, 0x00, 0x00, 0x00,
        ];
        msg.extend_from_slice(&labels("www.example.com"));
        msg.extend_from_slice(&[0, 1, 0, 1]);
        // CNAME answer, name compressed back to the question
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&[0, 5, 0, 1, 0, 0, 0, 60]);
        let cname = labels("cdn.example.net");
        msg.extend_from_slice(&(cname.len() as u16).to_be_bytes());
        msg.extend_from_slice(&cname);
        // A answer
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 93, 184, 216, 34]);

        engine.on_datagram(&mut s, &msg);

        assert_eq!(
            Some(&FieldValue::StrHash(vec![
                "www.example.com".to_string(),
                "cdn.example.net".to_string(),
            ])),
            s.fields.get(field::DNS_HOST)
        );
        assert_eq!(
            Some(&FieldValue::IpHash(vec![u32::from_le_bytes([
                93, 184, 216, 34
            ])])),
            s.fields.get(field::DNS_IP)
        );
    }

    #[test]
    fn test_pointer_loop_terminates() {
        // A name that points at itself
        let mut msg = vec![
            0x12, 0x34, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        msg.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
        let mut bsb = Bsb::new(&msg[12..]);
        assert_eq!(None, decode_name(&msg, &mut bsb));
    }

    #[test]
    fn test_label_sanitizing() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[4, b'a', 0x01, 0x81, b'b', 0]);
        // 0x01 -> ^A, 0x81 -> M-^A
        let mut bsb = Bsb::new(&msg[12..]);
        let name = decode_name(&msg, &mut bsb).unwrap();
        assert!(name.starts_with("a^A"));
        assert!(name.contains("M-"));
    }
}
