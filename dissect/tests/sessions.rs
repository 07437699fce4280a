//! End-to-end dissection scenarios driven through the public engine API.

use dissect::{field, Direction, Engine, EngineConfig, FieldValue, FiveTuple};
use pretty_assertions::assert_eq;

fn tcp_session(engine: &Engine, dst_port: u16) -> dissect::Session {
    engine.new_session(FiveTuple::tcp(
        "192.0.2.10".parse().unwrap(),
        49152,
        "192.0.2.20".parse().unwrap(),
        dst_port,
    ))
}

fn strings(session: &dissect::Session, id: dissect::FieldId) -> Vec<String> {
    match session.fields.get(id) {
        Some(FieldValue::StrHash(v)) | Some(FieldValue::StrArray(v)) => v.clone(),
        _ => Vec::new(),
    }
}

#[test]
fn http_get_with_host() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET /a HTTP/1.1\r\nHost: X.com\r\n\r\n",
        0,
    );

    assert_eq!(vec!["x.com".to_string()], strings(&s, field::HTTP_HOST));
    assert_eq!(vec!["//x.com/a".to_string()], strings(&s, field::HTTP_URLS));
    assert!(s.fields.has_tag("protocol:http"));
    assert!(s.fields.has_tag("http:method:GET"));
    assert_eq!(vec!["1.1".to_string()], strings(&s, field::HTTP_VER_REQ));
}

#[test]
fn http_host_and_url_disagree() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET http://a.com/x HTTP/1.1\r\nHost: b.com\r\n\r\n",
        0,
    );

    assert_eq!(
        vec!["//b.com;http://a.com/x".to_string()],
        strings(&s, field::HTTP_URLS)
    );
    assert_eq!(vec!["b.com".to_string()], strings(&s, field::HTTP_HOST));
}

#[test]
fn http_host_within_absolute_url() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET http://a.com/x HTTP/1.1\r\nHost: a.com\r\n\r\n",
        0,
    );

    assert_eq!(
        vec!["http://a.com/x".to_string()],
        strings(&s, field::HTTP_URLS)
    );
}

#[test]
fn http_body_md5_and_password_tag() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    let body = b"user=a&password=hunter2";
    let request = format!(
        "POST /login HTTP/1.1\r\nHost: x.com\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    engine.on_tcp_bytes(&mut s, Direction::Client, request.as_bytes(), 0);
    engine.on_tcp_bytes(&mut s, Direction::Client, body, request.len() as u64);

    assert!(s.fields.has_tag("http:password"));
    let digest = format!("{:x}", md5::compute(&body[..]));
    assert_eq!(vec![digest], strings(&s, field::HTTP_MD5));
}

#[test]
fn http_xff_routing_and_bad_entries() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET / HTTP/1.1\r\nX-Forwarded-For: 10.1.2.3, not-an-ip\r\n\r\n",
        0,
    );

    assert_eq!(
        Some(&FieldValue::IpHash(vec![u32::from_le_bytes([10, 1, 2, 3])])),
        s.fields.get(field::HTTP_XFF)
    );
    assert!(s.fields.has_tag("http:bad-xff"));
    assert!(strings(&s, field::HTTP_TAGS_REQ)
        .contains(&"http:header:x-forwarded-for".to_string()));
}

#[test]
fn http_long_header_name_is_truncated() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    let name = "x".repeat(50);
    let req = format!("GET / HTTP/1.1\r\n{}: v\r\n\r\n", name);
    engine.on_tcp_bytes(&mut s, Direction::Client, req.as_bytes(), 0);

    let expected = format!("http:header:{}", "x".repeat(40));
    assert_eq!(vec![expected], strings(&s, field::HTTP_TAGS_REQ));
}

#[test]
fn http_control_char_url() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET /a\x01b HTTP/1.1\r\nHost: x.com\r\n\r\n",
        0,
    );
    assert!(s.fields.has_tag("http:control-char"));
}

#[test]
fn http_response_status_and_version() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 80);

    engine.on_tcp_bytes(
        &mut s,
        Direction::Server,
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        0,
    );

    assert!(s.fields.has_tag("http:statuscode:404"));
    assert_eq!(vec!["1.1".to_string()], strings(&s, field::HTTP_VER_RES));
}

#[test]
fn smtp_mime_base64_attachment() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 25);

    let stream: &[u8] = b"HELO relay.example\r\n\
        MAIL FROM:<a@b>\r\n\
        RCPT TO:<c@d>\r\n\
        DATA\r\n\
        Subject: greetings\r\n\
        Content-Type: multipart/mixed; boundary=\"BND\"\r\n\
        \r\n\
        preamble\r\n\
        --BND\r\n\
        Content-Disposition: attachment; filename=\"h.txt\"\r\n\
        Content-Transfer-Encoding: base64\r\n\
        \r\n\
        aGVsbG8=\r\n\
        --BND--\r\n\
        .\r\n";

    engine.on_tcp_bytes(&mut s, Direction::Client, stream, 0);

    assert!(s.fields.has_tag("protocol:smtp"));
    assert_eq!(vec!["a@b".to_string()], strings(&s, field::EMAIL_SRC));
    assert_eq!(vec!["c@d".to_string()], strings(&s, field::EMAIL_DST));
    assert_eq!(vec!["greetings".to_string()], strings(&s, field::EMAIL_SUB));
    assert_eq!(vec!["h.txt".to_string()], strings(&s, field::EMAIL_FN));
    let digest = format!("{:x}", md5::compute(&b"hello"[..]));
    assert_eq!(vec![digest], strings(&s, field::EMAIL_MD5));
}

#[test]
fn smtp_header_addresses_and_message_id() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 25);

    let stream: &[u8] = b"EHLO relay\r\n\
        DATA\r\n\
        To: \"Big C\" <C@D.example>, e@f.example\r\n\
        From: a@b.example\r\n\
        Message-ID: <m1@relay>\r\n\
        X-Originating-IP: [10.9.8.7]\r\n\
        \r\n\
        .\r\n";

    engine.on_tcp_bytes(&mut s, Direction::Client, stream, 0);

    assert_eq!(
        vec!["c@d.example".to_string(), "e@f.example".to_string()],
        strings(&s, field::EMAIL_DST)
    );
    assert_eq!(vec!["a@b.example".to_string()], strings(&s, field::EMAIL_SRC));
    assert_eq!(vec!["m1@relay".to_string()], strings(&s, field::EMAIL_ID));
    assert_eq!(
        Some(&FieldValue::IpHash(vec![u32::from_le_bytes([10, 9, 8, 7])])),
        s.fields.get(field::EMAIL_IP)
    );
}

#[test]
fn smtp_colonless_header_is_discarded() {
    let engine = Engine::new(EngineConfig::default());
    let mut s = tcp_session(&engine, 25);

    let stream: &[u8] = b"HELO x\r\nDATA\r\nnot a header line\r\nSubject: ok\r\n\r\n.\r\n";
    engine.on_tcp_bytes(&mut s, Direction::Client, stream, 0);

    assert_eq!(vec!["ok".to_string()], strings(&s, field::EMAIL_SUB));
}

#[test]
fn reassembly_boundary_independence() {
    let streams: Vec<(&str, u16, Vec<u8>)> = vec![
        (
            "http",
            80,
            b"POST /up HTTP/1.1\r\nHost: x.com\r\nUser-Agent: curl/7\r\nContent-Length: 11\r\n\r\nhello world"
                .to_vec(),
        ),
        (
            "smtp",
            25,
            b"HELO a\r\nMAIL FROM:<a@b>\r\nDATA\r\nContent-Type: multipart/mixed; boundary=\"Q\"\r\n\r\n--Q\r\nContent-Transfer-Encoding: base64\r\n\r\nc3BsaXQgbWU=\r\n--Q--\r\n.\r\n"
                .to_vec(),
        ),
    ];

    // The content sniff runs on whatever the first body chunk happens to be,
    // so its tag legitimately depends on segmentation; drop it before
    // comparing.
    fn strip_content_tag(mut doc: serde_json::Value) -> serde_json::Value {
        if let Some(tags) = doc["ta"].as_array_mut() {
            tags.retain(|t| {
                t.as_str()
                    .map(|t| !t.starts_with("http:content:"))
                    .unwrap_or(true)
            });
        }
        doc
    }

    for (label, port, bytes) in streams {
        let engine = Engine::new(EngineConfig::default());
        let mut reference = tcp_session(&engine, port);
        engine.on_tcp_bytes(&mut reference, Direction::Client, &bytes, 0);
        let expected = strip_content_tag(engine.document(&reference));

        for split in 1..bytes.len() {
            let mut s = tcp_session(&engine, port);
            let mut offset = 0u64;
            for chunk in bytes.chunks(split) {
                engine.on_tcp_bytes(&mut s, Direction::Client, chunk, offset);
                offset += chunk.len() as u64;
            }
            assert_eq!(
                expected,
                strip_content_tag(engine.document(&s)),
                "{} stream split at {}",
                label,
                split
            );
        }
    }
}

#[test]
fn document_shape() {
    let engine = Engine::new(EngineConfig {
        node_name: "probe1".to_string(),
        node_class: Some("edge".to_string()),
        extra_tags: vec!["lab".to_string()],
        ..EngineConfig::default()
    });
    let mut s = tcp_session(&engine, 80);
    engine.on_tcp_bytes(
        &mut s,
        Direction::Client,
        b"GET / HTTP/1.1\r\nHost: x.com\r\n\r\n",
        0,
    );
    let doc = engine.document(&s);

    let tags: Vec<&str> = doc["ta"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap())
        .collect();
    assert!(tags.contains(&"node:probe1"));
    assert!(tags.contains(&"node:edge"));
    assert!(tags.contains(&"lab"));
    assert!(tags.contains(&"tcp"));
    assert_eq!("192.0.2.10", doc["src"]);
    assert_eq!(80, doc["dstPort"]);
    assert_eq!(1, doc["hocnt"]);
}
