//! Protocol detection and dissection engine.
//!
//! Given reassembled transport flows, the engine classifies the application
//! protocol, incrementally parses it across arbitrary segment boundaries, and
//! extracts indexable fields (hosts, URLs, certificates, DNS names, mail
//! addresses, SSH banners, IRC nicks/channels, MIME attachments) into a typed
//! per-session field store.
//!
//! The upstream reassembler owns the sessions and lends them to the engine
//! one half-stream callback at a time:
//!
//! ```
//! use dissect::{Direction, Engine, EngineConfig, FiveTuple};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let mut session = engine.new_session(FiveTuple::tcp(
//!     "10.0.0.1".parse().unwrap(), 49152,
//!     "10.0.0.2".parse().unwrap(), 80,
//! ));
//! engine.on_tcp_bytes(&mut session, Direction::Client,
//!                     b"GET /a HTTP/1.1\r\nHost: X.com\r\n\r\n", 0);
//! let doc = engine.document(&session);
//! assert!(doc["ta"].as_array().unwrap().iter().any(|t| t == "protocol:http"));
//! ```

pub mod asn1;
pub mod bsb;
mod classify;
mod dns;
pub mod fields;
pub mod hooks;
mod http;
mod irc;
mod magic;
mod smtp;
mod ssh;
mod tls;

pub use crate::fields::{field, FieldId, FieldKind, FieldRegistry, FieldStore, FieldValue};
pub use crate::hooks::{Hooks, NoopHooks};
pub use crate::tls::{CertDn, CertInfo, CertString};

use crate::magic::MimeClassifier;
use fnv::FnvHashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::Ipv4Addr;

/// Which half of the flow a callback refers to. The initiator is the client.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Client => 0,
            Direction::Server => 1,
        }
    }

    pub fn other(self) -> Direction {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }

    pub fn is_client(self) -> bool {
        self == Direction::Client
    }
}

/// Session identity as seen by the reassembler.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize)]
pub struct FiveTuple {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    /// IP protocol number (6 = TCP, 17 = UDP, 1 = ICMP).
    pub protocol: u8,
}

impl FiveTuple {
    pub fn tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src,
            src_port,
            dst,
            dst_port,
            protocol: 6,
        }
    }

    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src,
            src_port,
            dst,
            dst_port,
            protocol: 17,
        }
    }
}

/// Configuration consumed by the engine. Everything else about dissector
/// behavior is fixed.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Seeds the `node:<name>` tag on every session.
    pub node_name: String,
    /// Optional second seed tag, also in the `node:` namespace.
    pub node_class: Option<String>,
    /// Extra tags seeded on every session.
    pub extra_tags: Vec<String>,
    /// SMTP header names (lower-case, no colon) whose values are parsed as
    /// IPv4 addresses wrapped in `[]`.
    pub smtp_ip_headers: Vec<String>,
    /// Request header name (lower-case) to field routing.
    pub request_headers: Vec<(String, FieldId)>,
    /// Response header name (lower-case) to field routing.
    pub response_headers: Vec<(String, FieldId)>,
    /// Mail header name (lower-case) to field routing.
    pub email_headers: Vec<(String, FieldId)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_name: "flowprobe".to_string(),
            node_class: None,
            extra_tags: Vec::new(),
            smtp_ip_headers: vec!["x-originating-ip".to_string()],
            request_headers: vec![
                ("user-agent".to_string(), field::HTTP_UA),
                ("x-forwarded-for".to_string(), field::HTTP_XFF),
            ],
            response_headers: Vec::new(),
            email_headers: vec![
                ("subject".to_string(), field::EMAIL_SUB),
                ("x-mailer".to_string(), field::EMAIL_MV),
                ("user-agent".to_string(), field::EMAIL_UA),
            ],
        }
    }
}

/// Bytes of one half-stream are buffered from offset 0 up to this limit so
/// the classifier and the TLS certificate walker can re-scan them.
const CLASSIFY_BUFFER_MAX: usize = 1 << 20;

/// The explicit context threaded through all dissector calls: field
/// registry, header routing maps, MIME classifier and plugin hooks.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: FieldRegistry,
    pub(crate) req_headers: FnvHashMap<String, FieldId>,
    pub(crate) res_headers: FnvHashMap<String, FieldId>,
    pub(crate) email_headers: FnvHashMap<String, FieldId>,
    pub(crate) magic: MimeClassifier,
    pub(crate) hooks: Box<dyn Hooks + Send + Sync>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_hooks(config, Box::new(NoopHooks))
    }

    pub fn with_hooks(config: EngineConfig, hooks: Box<dyn Hooks + Send + Sync>) -> Self {
        let registry = FieldRegistry::standard();
        let req_headers = config.request_headers.iter().cloned().collect();
        let res_headers = config.response_headers.iter().cloned().collect();
        let email_headers = config.email_headers.iter().cloned().collect();
        Self {
            config,
            registry,
            req_headers,
            res_headers,
            email_headers,
            magic: MimeClassifier::new(),
            hooks,
        }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    /// Create a session with its initial tag set.
    pub fn new_session(&self, tuple: FiveTuple) -> Session {
        let mut session = Session::new(&self.registry, tuple);

        session
            .fields
            .add_tag(&self.registry, &format!("node:{}", self.config.node_name));
        if let Some(class) = &self.config.node_class {
            session
                .fields
                .add_tag(&self.registry, &format!("node:{}", class));
        }
        for tag in &self.config.extra_tags {
            session.fields.add_tag(&self.registry, tag);
        }
        match tuple.protocol {
            6 => session.fields.add_tag(&self.registry, "tcp"),
            17 => session.fields.add_tag(&self.registry, "udp"),
            1 => session.fields.add_tag(&self.registry, "ICMP"),
            _ => {}
        }

        self.hooks.session_new(&session);
        session
    }

    /// Deliver one newly arrived contiguous chunk of a TCP half-stream.
    ///
    /// `offset` is the absolute stream offset of `bytes`. Chunks of one
    /// direction must arrive in stream order; the two directions may be
    /// interleaved arbitrarily.
    pub fn on_tcp_bytes(&self, session: &mut Session, dir: Direction, bytes: &[u8], offset: u64) {
        let d = dir.index();

        // Keep the head of each half-stream around for the classifier while
        // it still lines up with stream offset 0.
        if session.classify_open[d] {
            if offset == session.classify_buf[d].len() as u64
                && session.classify_buf[d].len() + bytes.len() <= CLASSIFY_BUFFER_MAX
            {
                session.classify_buf[d].extend_from_slice(bytes);
            } else {
                session.classify_open[d] = false;
            }
        }

        if session.classify_open[d] {
            classify::classify(self, session, dir, bytes.len());
        }

        if session.is_ssh {
            ssh::parse(self, session, dir, bytes);
        }
        if session.is_irc {
            irc::parse(self, session, dir, bytes);
        }
        if session.email.is_some() {
            smtp::parse(self, session, dir, bytes);
        }
        http::parse(self, session, dir, bytes, offset);
    }

    /// Deliver a UDP datagram payload (DNS).
    pub fn on_datagram(&self, session: &mut Session, payload: &[u8]) {
        dns::parse(self, session, payload);
    }

    /// Final flush opportunity before the session is destroyed.
    pub fn on_close(&self, session: &mut Session) {
        http::close(self, session);
        session.classify_buf[0] = Vec::new();
        session.classify_buf[1] = Vec::new();
    }

    /// Route a recognized header value into its configured field, following
    /// the field's declared type: permissive integer parsing for int fields,
    /// comma-separated IPv4 lists for ip fields, trimmed strings otherwise.
    pub(crate) fn add_routed_value(&self, session: &mut Session, id: FieldId, raw: &[u8]) {
        let trimmed = trim_start(raw);

        match self.registry.def(id).kind {
            FieldKind::Int | FieldKind::IntArray | FieldKind::IntHash => {
                session
                    .fields
                    .add_int(&self.registry, id, permissive_atoi(trimmed));
            }
            FieldKind::Str | FieldKind::StrArray | FieldKind::StrHash => {
                let value = String::from_utf8_lossy(trimmed).into_owned();
                session.fields.add_string(&self.registry, id, value);
            }
            FieldKind::IpHash => {
                for part in trimmed.split(|&b| b == b',') {
                    let part = trim_start(part);
                    match parse_ipv4_wire(part) {
                        Some(ip) => {
                            session.fields.add_int(&self.registry, id, ip);
                        }
                        None => {
                            session.fields.add_tag(&self.registry, "http:bad-xff");
                            log::warn!(
                                "did not understand ip: {}",
                                String::from_utf8_lossy(part)
                            );
                        }
                    }
                }
            }
        }
    }

    /// Render the session as one JSON metadata document.
    pub fn document(&self, session: &Session) -> Value {
        let mut doc = session.fields.document(&self.registry);
        if !session.certs.is_empty() {
            doc.insert(
                "tls".to_string(),
                serde_json::to_value(&session.certs).unwrap_or(Value::Null),
            );
        }
        doc.insert("src".to_string(), json!(session.tuple.src.to_string()));
        doc.insert("srcPort".to_string(), json!(session.tuple.src_port));
        doc.insert("dst".to_string(), json!(session.tuple.dst.to_string()));
        doc.insert("dstPort".to_string(), json!(session.tuple.dst_port));
        doc.insert("ipProtocol".to_string(), json!(session.tuple.protocol));
        Value::Object(doc)
    }
}

pub(crate) fn trim_start(mut s: &[u8]) -> &[u8] {
    while !s.is_empty() && s[0].is_ascii_whitespace() {
        s = &s[1..];
    }
    s
}

/// `atoi`-style integer parse: leading sign and digits, everything else 0.
pub(crate) fn permissive_atoi(s: &[u8]) -> u32 {
    let (neg, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            break;
        }
        value = (value * 10 + i64::from(b - b'0')).min(i64::from(u32::max_value()));
    }
    if neg {
        value = -value;
    }
    value as u32
}

/// Parse a dotted-quad IPv4 address into wire order (lowest octet first).
///
/// Unparseable input, 0.0.0.0 and 255.255.255.255 are all rejected, the
/// latter two matching the classic `inet_addr` failure values.
pub(crate) fn parse_ipv4_wire(s: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(s).ok()?;
    let addr: Ipv4Addr = text.trim_end().parse().ok()?;
    let wire = u32::from_le_bytes(addr.octets());
    if wire == 0 || wire == 0xffff_ffff {
        None
    } else {
        Some(wire)
    }
}

/// Per-session accumulation state. Owned by the reassembler, lent mutably to
/// the engine one half-stream callback at a time.
pub struct Session {
    pub tuple: FiveTuple,
    pub fields: FieldStore,

    pub(crate) certs: Vec<CertInfo>,

    pub(crate) http: Option<Box<http::HttpState>>,
    pub(crate) email: Option<Box<smtp::EmailState>>,

    pub(crate) is_ssh: bool,
    pub(crate) ssh_remaining: usize,
    pub(crate) is_irc: bool,
    pub(crate) irc_midline: bool,

    pub(crate) classify_buf: [Vec<u8>; 2],
    pub(crate) classify_open: [bool; 2],
}

impl Session {
    fn new(reg: &FieldRegistry, tuple: FiveTuple) -> Self {
        Self {
            tuple,
            fields: FieldStore::new(reg),
            certs: Vec::new(),
            http: None,
            email: None,
            is_ssh: false,
            ssh_remaining: 0,
            is_irc: false,
            irc_midline: false,
            classify_buf: [Vec::new(), Vec::new()],
            classify_open: [true, true],
        }
    }

    /// Certificates collected from the session, deduplicated.
    pub fn certificates(&self) -> &[CertInfo] {
        &self.certs
    }
}
