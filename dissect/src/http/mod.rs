//! HTTP dissection: drives one push parser per direction and turns parse
//! events into fields and tags.

mod parser;

use self::parser::{Event, Parser};
use crate::classify::find;
use crate::fields::field;
use crate::{Direction, Engine, FieldId, Session};
use log::debug;
use std::mem;

/// Header names are clipped to this many bytes before lookup.
const HEADER_NAME_MAX: usize = 40;

pub(crate) struct HttpState {
    parsers: [Parser; 2],
    /// Bit per direction whose parser is still live.
    w_parsers: u8,
    in_value: [bool; 2],
    in_body: [bool; 2],
    seen_first_field: [bool; 2],
    header: [Vec<u8>; 2],
    routed: [Option<FieldId>; 2],
    value: [Vec<u8>; 2],
    checksum: [md5::Context; 2],
    /// Pending URL and Host accumulators, shared by the message being
    /// reconciled at message-complete.
    url: Vec<u8>,
    host: Vec<u8>,
}

impl HttpState {
    fn new() -> Self {
        Self {
            parsers: [Parser::new(), Parser::new()],
            w_parsers: 0x3,
            in_value: [false; 2],
            in_body: [false; 2],
            seen_first_field: [false; 2],
            header: [Vec::new(), Vec::new()],
            routed: [None; 2],
            value: [Vec::new(), Vec::new()],
            checksum: [md5::Context::new(), md5::Context::new()],
            url: Vec::new(),
            host: Vec::new(),
        }
    }
}

pub(crate) fn parse(
    engine: &Engine,
    session: &mut Session,
    dir: Direction,
    bytes: &[u8],
    offset: u64,
) {
    if session.http.is_none() {
        if offset != 0 {
            return;
        }
        session.http = Some(Box::new(HttpState::new()));
    }

    let mut http = match session.http.take() {
        Some(http) => http,
        None => return,
    };
    let d = dir.index();

    if http.w_parsers & (1 << d) == 0 {
        session.http = Some(http);
        return;
    }

    let mut events = Vec::new();
    let result = http.parsers[d].execute(bytes, &mut events);
    process_events(engine, session, &mut http, dir, events);

    match result {
        Ok(()) => {
            session.http = Some(http);
        }
        Err(err) => {
            debug!("http parser retired ({:?}): {}", dir, err);
            http.w_parsers &= !(1 << d);
            if http.w_parsers != 0 {
                session.http = Some(http);
            }
        }
    }
}

/// Stream-end flush: completes read-until-close response bodies.
pub(crate) fn close(engine: &Engine, session: &mut Session) {
    let mut http = match session.http.take() {
        Some(http) => http,
        None => return,
    };

    for dir in [Direction::Client, Direction::Server].iter().cloned() {
        let d = dir.index();
        if http.w_parsers & (1 << d) == 0 {
            continue;
        }
        let mut events = Vec::new();
        http.parsers[d].finish(&mut events);
        process_events(engine, session, &mut http, dir, events);
    }

    session.http = Some(http);
}

fn process_events(
    engine: &Engine,
    session: &mut Session,
    http: &mut HttpState,
    dir: Direction,
    events: Vec<Event<'_>>,
) {
    let reg = &engine.registry;
    let d = dir.index();

    for event in events {
        match event {
            Event::MessageBegin => {
                http.in_value[d] = false;
                http.in_body[d] = false;
                http.seen_first_field[d] = false;
                http.checksum[d] = md5::Context::new();
                engine.hooks.http_message_begin(session, dir);
            }

            Event::Url(url) => {
                http.url.extend_from_slice(&url);
            }

            Event::HeaderField(name) => {
                if !http.seen_first_field[d] {
                    http.seen_first_field[d] = true;
                    if !http.url.is_empty() && http.parsers[d].is_request() {
                        engine.hooks.http_url(session, dir, &http.url);
                    }
                }

                if http.in_value[d] {
                    http.in_value[d] = false;
                    http.header[d].clear();
                    if http.routed[d].is_some() {
                        flush_value(engine, session, http, d);
                    }
                }

                let room = HEADER_NAME_MAX - http.header[d].len().min(HEADER_NAME_MAX);
                http.header[d].extend_from_slice(&name[..name.len().min(room)]);
            }

            Event::HeaderValue(value) => {
                if !http.in_value[d] {
                    http.in_value[d] = true;

                    let lower =
                        String::from_utf8_lossy(&http.header[d].to_ascii_lowercase()).into_owned();
                    engine.hooks.http_header_field(session, dir, lower.as_bytes());

                    let map = if dir.is_client() {
                        &engine.req_headers
                    } else {
                        &engine.res_headers
                    };
                    http.routed[d] = map.get(&lower).cloned();

                    let tag_field = if dir.is_client() {
                        field::HTTP_TAGS_REQ
                    } else {
                        field::HTTP_TAGS_RES
                    };
                    session
                        .fields
                        .add_string(reg, tag_field, format!("http:header:{}", lower));

                    if http.parsers[d].is_request() && lower == "host" {
                        if http.host.is_empty() {
                            http.host.extend_from_slice(b"//");
                        }
                        http.host.extend_from_slice(&value);
                    }

                    if http.routed[d].is_some() {
                        http.value[d] = value.clone();
                    }
                }

                engine.hooks.http_header_value(session, dir, &value);
            }

            Event::HeadersComplete(head) => {
                let version = format!("{}.{}", head.version_major, head.version_minor);
                if head.is_request {
                    session
                        .fields
                        .add_tag(reg, &format!("http:method:{}", head.method));
                    session.fields.add_string(reg, field::HTTP_VER_REQ, version);
                } else {
                    session
                        .fields
                        .add_tag(reg, &format!("http:statuscode:{}", head.status));
                    session.fields.add_string(reg, field::HTTP_VER_RES, version);
                }

                if http.in_value[d] && http.routed[d].is_some() {
                    flush_value(engine, session, http, d);
                }

                engine.hooks.http_headers_complete(session, dir);
            }

            Event::Body(chunk) => {
                if !http.in_body[d] {
                    if find(chunk, b"password=").is_some() {
                        session.fields.add_tag(reg, "http:password");
                    }
                    if let Some(mime) = engine.magic.probe(chunk) {
                        session
                            .fields
                            .add_tag(reg, &format!("http:content:{}", mime));
                    }
                    http.in_body[d] = true;
                }

                http.checksum[d].consume(chunk);
                engine.hooks.http_body(session, dir, chunk);
            }

            Event::MessageComplete => {
                engine.hooks.http_message_complete(session, dir);
                message_complete(engine, session, http, d);
            }
        }
    }
}

fn flush_value(engine: &Engine, session: &mut Session, http: &mut HttpState, d: usize) {
    if let Some(id) = http.routed[d].take() {
        let value = mem::replace(&mut http.value[d], Vec::new());
        engine.add_routed_value(session, id, &value);
    }
}

/// URL/Host reconciliation and body digest emission.
fn message_complete(engine: &Engine, session: &mut Session, http: &mut HttpState, d: usize) {
    let reg = &engine.registry;

    http.header[0].clear();
    http.header[1].clear();

    if http.url.iter().any(|&b| b < 0x20) {
        session.fields.add_tag(reg, "http:control-char");
    }

    http.host.make_ascii_lowercase();

    let url = mem::replace(&mut http.url, Vec::new());
    let host = mem::replace(&mut http.host, Vec::new());

    if !url.is_empty() && !host.is_empty() {
        add_host_field(engine, session, &host);

        if url[0] != b'/' {
            match find(&url, &host[2..]) {
                // Host header repeated at the front of an absolute URL
                Some(pos) if pos <= 8 => {
                    session.fields.add_string(
                        reg,
                        field::HTTP_URLS,
                        String::from_utf8_lossy(&url).into_owned(),
                    );
                }
                // Host and URL disagree; keep both, separated by a semicolon
                _ => {
                    let mut combined = host.clone();
                    combined.push(b';');
                    combined.extend_from_slice(&url);
                    session.fields.add_string(
                        reg,
                        field::HTTP_URLS,
                        String::from_utf8_lossy(&combined).into_owned(),
                    );
                }
            }
        } else {
            let mut combined = host.clone();
            combined.extend_from_slice(&url);
            session.fields.add_string(
                reg,
                field::HTTP_URLS,
                String::from_utf8_lossy(&combined).into_owned(),
            );
        }

        session.fields.add_tag(reg, "protocol:http");
    } else if !url.is_empty() {
        session.fields.add_string(
            reg,
            field::HTTP_URLS,
            String::from_utf8_lossy(&url).into_owned(),
        );
        session.fields.add_tag(reg, "protocol:http");
    } else if !host.is_empty() {
        add_host_field(engine, session, &host);
    }

    if http.in_body[d] {
        let digest = mem::replace(&mut http.checksum[d], md5::Context::new()).compute();
        session
            .fields
            .add_string(reg, field::HTTP_MD5, format!("{:x}", digest));
    }
}

/// Store the Host header (minus the `//` prefix and any `:port`).
fn add_host_field(engine: &Engine, session: &mut Session, host: &[u8]) {
    let bare = &host[2.min(host.len())..];
    let end = bare.iter().position(|&b| b == b':').unwrap_or(bare.len());
    session.fields.add_string(
        &engine.registry,
        field::HTTP_HOST,
        String::from_utf8_lossy(&bare[..end]).into_owned(),
    );
}
