//! Narrow plugin hook surface.
//!
//! The engine fires these at fixed sites inside the HTTP and SMTP dissectors;
//! everything a plugin learns beyond that comes from the finished session
//! document. All methods default to no-ops.

use crate::{Direction, Session};

#[allow(unused_variables)]
pub trait Hooks {
    fn session_new(&self, session: &Session) {}

    fn http_message_begin(&self, session: &Session, dir: Direction) {}
    fn http_url(&self, session: &Session, dir: Direction, url: &[u8]) {}
    fn http_header_field(&self, session: &Session, dir: Direction, name: &[u8]) {}
    fn http_header_value(&self, session: &Session, dir: Direction, value: &[u8]) {}
    fn http_headers_complete(&self, session: &Session, dir: Direction) {}
    fn http_body(&self, session: &Session, dir: Direction, chunk: &[u8]) {}
    fn http_message_complete(&self, session: &Session, dir: Direction) {}

    fn smtp_header(&self, session: &Session, dir: Direction, name: &str, value: &[u8]) {}
    fn smtp_headers_complete(&self, session: &Session, dir: Direction) {}
}

/// Hook sink used when no plugins are loaded.
pub struct NoopHooks;

impl Hooks for NoopHooks {}
