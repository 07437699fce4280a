//! Incremental HTTP/1.x push parser.
//!
//! Feeds arbitrary byte chunks and emits parse events; no event ever spans a
//! feeding boundary incorrectly because start and header lines are buffered
//! internally while body bytes stream straight through. Any grammar
//! violation returns an error, which is how non-HTTP traffic sheds the
//! parser that every TCP session initially carries.

use failure::Fail;
use std::mem;

const MAX_LINE: usize = 8192;

#[derive(Debug, Fail)]
#[fail(display = "not http: {}", _0)]
pub struct ParseError(&'static str);

/// Request/status line data available at headers-complete.
#[derive(Clone, Debug, Default)]
pub struct Head {
    pub is_request: bool,
    pub method: String,
    pub status: u16,
    pub version_major: u8,
    pub version_minor: u8,
}

#[derive(Debug)]
pub enum Event<'a> {
    MessageBegin,
    Url(Vec<u8>),
    HeaderField(Vec<u8>),
    HeaderValue(Vec<u8>),
    HeadersComplete(Head),
    Body(&'a [u8]),
    MessageComplete,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Start,
    Header,
    BodyIdentity,
    BodyUntilClose,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    Trailer,
    Dead,
}

pub struct Parser {
    state: State,
    line: Vec<u8>,
    pending: Option<(Vec<u8>, Vec<u8>)>,
    head: Head,
    content_length: Option<u64>,
    chunked: bool,
    body_remaining: u64,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            line: Vec::new(),
            pending: None,
            head: Head::default(),
            content_length: None,
            chunked: false,
            body_remaining: 0,
        }
    }

    /// Whether the message currently being parsed is a request.
    pub fn is_request(&self) -> bool {
        self.head.is_request
    }

    /// Parse another chunk, appending events to `out`.
    ///
    /// After an error the parser is dead and must not be fed again.
    pub fn execute<'a>(
        &mut self,
        data: &'a [u8],
        out: &mut Vec<Event<'a>>,
    ) -> Result<(), ParseError> {
        let mut i = 0;

        while i < data.len() {
            match self.state {
                State::Start | State::Header | State::ChunkSize | State::Trailer => {
                    let c = data[i];
                    i += 1;
                    if c == b'\n' {
                        let mut line = mem::replace(&mut self.line, Vec::new());
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        self.on_line(line, out)?;
                    } else {
                        if self.line.len() >= MAX_LINE {
                            self.state = State::Dead;
                            return Err(ParseError("line too long"));
                        }
                        self.line.push(c);
                    }
                }
                State::BodyIdentity | State::ChunkData => {
                    let avail = (data.len() - i) as u64;
                    let take = self.body_remaining.min(avail) as usize;
                    out.push(Event::Body(&data[i..i + take]));
                    i += take;
                    self.body_remaining -= take as u64;
                    if self.body_remaining == 0 {
                        if self.state == State::BodyIdentity {
                            self.finish_message(out);
                        } else {
                            self.state = State::ChunkDataEnd;
                        }
                    }
                }
                State::BodyUntilClose => {
                    out.push(Event::Body(&data[i..]));
                    i = data.len();
                }
                State::ChunkDataEnd => {
                    let c = data[i];
                    i += 1;
                    if c == b'\n' {
                        self.state = State::ChunkSize;
                    } else if c != b'\r' {
                        self.state = State::Dead;
                        return Err(ParseError("bad chunk terminator"));
                    }
                }
                State::Dead => return Err(ParseError("parser is dead")),
            }
        }

        Ok(())
    }

    /// Final flush at stream end: completes a read-until-close body.
    pub fn finish<'a>(&mut self, out: &mut Vec<Event<'a>>) {
        if self.state == State::BodyUntilClose {
            self.finish_message(out);
        }
    }

    fn on_line(&mut self, line: Vec<u8>, out: &mut Vec<Event<'_>>) -> Result<(), ParseError> {
        match self.state {
            State::Start => {
                if line.is_empty() {
                    // Stray CRLF between pipelined messages
                    return Ok(());
                }
                out.push(Event::MessageBegin);
                self.content_length = None;
                self.chunked = false;
                self.start_line(&line, out)?;
                self.state = State::Header;
                Ok(())
            }
            State::Header => {
                if line.is_empty() {
                    self.flush_pending(out);
                    out.push(Event::HeadersComplete(self.head.clone()));
                    self.begin_body(out);
                } else if line[0] == b' ' || line[0] == b'\t' {
                    // obs-fold continuation of the previous value
                    if let Some((_, value)) = &mut self.pending {
                        value.extend_from_slice(&line);
                    }
                } else {
                    self.flush_pending(out);
                    let colon = line
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or(ParseError("header without colon"))?;
                    let name = line[..colon].to_vec();
                    if name.is_empty() || name.iter().any(|&b| b == b' ') {
                        self.state = State::Dead;
                        return Err(ParseError("bad header name"));
                    }
                    let value = crate::trim_start(&line[colon + 1..]).to_vec();
                    self.pending = Some((name, value));
                }
                Ok(())
            }
            State::ChunkSize => {
                let hex = line.split(|&b| b == b';').next().unwrap_or(&[]);
                let hex: Vec<u8> = hex
                    .iter()
                    .cloned()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                if hex.is_empty() || !hex.iter().all(u8::is_ascii_hexdigit) {
                    self.state = State::Dead;
                    return Err(ParseError("bad chunk size"));
                }
                let mut size: u64 = 0;
                for &b in &hex {
                    size = size.wrapping_shl(4)
                        | u64::from(char::from(b).to_digit(16).unwrap_or(0));
                }
                if size == 0 {
                    self.state = State::Trailer;
                } else {
                    self.body_remaining = size;
                    self.state = State::ChunkData;
                }
                Ok(())
            }
            State::Trailer => {
                if line.is_empty() {
                    self.finish_message(out);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start_line(&mut self, line: &[u8], out: &mut Vec<Event<'_>>) -> Result<(), ParseError> {
        if line.starts_with(b"HTTP/") {
            // Status line
            self.head.is_request = false;
            self.head.method = String::new();
            let sp = line
                .iter()
                .position(|&b| b == b' ')
                .ok_or(ParseError("status line without status"))?;
            self.parse_version(&line[..sp])?;
            let status = crate::trim_start(&line[sp..]);
            let digits: Vec<u8> = status
                .iter()
                .cloned()
                .take_while(u8::is_ascii_digit)
                .collect();
            if digits.is_empty() {
                self.state = State::Dead;
                return Err(ParseError("bad status code"));
            }
            self.head.status = crate::permissive_atoi(&digits) as u16;
            Ok(())
        } else {
            // Request line: METHOD SP url SP HTTP/x.y
            let first = line
                .iter()
                .position(|&b| b == b' ')
                .ok_or(ParseError("no method"))?;
            let last = line
                .iter()
                .rposition(|&b| b == b' ')
                .ok_or(ParseError("no version"))?;
            if first == 0 || last <= first + 1 {
                self.state = State::Dead;
                return Err(ParseError("bad request line"));
            }

            let method = &line[..first];
            if !method
                .iter()
                .all(|&b| b.is_ascii_alphabetic() || b == b'-')
            {
                self.state = State::Dead;
                return Err(ParseError("bad method"));
            }

            if !line[last + 1..].starts_with(b"HTTP/") {
                self.state = State::Dead;
                return Err(ParseError("not a request line"));
            }
            self.parse_version(&line[last + 1..])?;

            self.head.is_request = true;
            self.head.status = 0;
            self.head.method = String::from_utf8_lossy(method).into_owned();
            out.push(Event::Url(line[first + 1..last].to_vec()));
            Ok(())
        }
    }

    fn parse_version(&mut self, token: &[u8]) -> Result<(), ParseError> {
        // token is "HTTP/<maj>.<min>"
        let rest = &token[5..];
        let dot = rest
            .iter()
            .position(|&b| b == b'.')
            .ok_or(ParseError("bad version"))?;
        let (maj, min) = (&rest[..dot], &rest[dot + 1..]);
        if maj.is_empty()
            || min.is_empty()
            || !maj.iter().all(u8::is_ascii_digit)
            || !min.iter().all(u8::is_ascii_digit)
        {
            self.state = State::Dead;
            return Err(ParseError("bad version"));
        }
        self.head.version_major = crate::permissive_atoi(maj) as u8;
        self.head.version_minor = crate::permissive_atoi(min) as u8;
        Ok(())
    }

    fn flush_pending(&mut self, out: &mut Vec<Event<'_>>) {
        if let Some((name, value)) = self.pending.take() {
            if name.eq_ignore_ascii_case(b"content-length") {
                let digits: Vec<u8> = value
                    .iter()
                    .cloned()
                    .take_while(u8::is_ascii_digit)
                    .collect();
                if !digits.is_empty() {
                    self.content_length =
                        Some(u64::from(crate::permissive_atoi(&digits)));
                }
            } else if name.eq_ignore_ascii_case(b"transfer-encoding")
                && crate::classify::find_case(&value, b"chunked").is_some()
            {
                self.chunked = true;
            }
            out.push(Event::HeaderField(name));
            out.push(Event::HeaderValue(value));
        }
    }

    fn begin_body(&mut self, out: &mut Vec<Event<'_>>) {
        if self.chunked {
            self.state = State::ChunkSize;
        } else if let Some(len) = self.content_length {
            if len > 0 {
                self.body_remaining = len;
                self.state = State::BodyIdentity;
            } else {
                self.finish_message(out);
            }
        } else if self.head.is_request
            || self.head.status < 200
            || self.head.status == 204
            || self.head.status == 304
        {
            self.finish_message(out);
        } else {
            self.state = State::BodyUntilClose;
        }
    }

    fn finish_message(&mut self, out: &mut Vec<Event<'_>>) {
        out.push(Event::MessageComplete);
        self.state = State::Start;
        self.pending = None;
        self.body_remaining = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn events_for(chunks: &[&[u8]]) -> Vec<String> {
        let mut parser = Parser::new();
        let mut names = Vec::new();
        for chunk in chunks {
            let mut out = Vec::new();
            parser.execute(chunk, &mut out).unwrap();
            for ev in &out {
                names.push(match ev {
                    Event::MessageBegin => "begin".to_string(),
                    Event::Url(u) => format!("url:{}", String::from_utf8_lossy(u)),
                    Event::HeaderField(f) => format!("field:{}", String::from_utf8_lossy(f)),
                    Event::HeaderValue(v) => format!("value:{}", String::from_utf8_lossy(v)),
                    Event::HeadersComplete(h) => format!("headers:{}", h.status),
                    Event::Body(b) => format!("body:{}", String::from_utf8_lossy(b)),
                    Event::MessageComplete => "complete".to_string(),
                });
            }
        }
        names
    }

    #[test]
    fn test_simple_get() {
        let ev = events_for(&[b"GET /a HTTP/1.1\r\nHost: x.com\r\n\r\n"]);
        assert_eq!(
            vec![
                "begin",
                "url:/a",
                "field:Host",
                "value:x.com",
                "headers:0",
                "complete"
            ],
            ev
        );
    }

    #[test]
    fn test_split_anywhere_same_events() {
        let data: &[u8] =
            b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let whole = events_for(&[data]);
        for split in 1..data.len() {
            let parts = [&data[..split], &data[split..]];
            let split_events = events_for(&parts);
            // Body chunks may be split differently; join them
            let join = |ev: Vec<String>| {
                let mut out: Vec<String> = Vec::new();
                for e in ev {
                    match (e.starts_with("body:"), out.last().map(|l| l.starts_with("body:"))) {
                        (true, Some(true)) => {
                            let prev = out.pop().unwrap();
                            out.push(format!("{}{}", prev, &e[5..]));
                        }
                        _ => out.push(e),
                    }
                }
                out
            };
            assert_eq!(join(whole.clone()), join(split_events), "split {}", split);
        }
    }

    #[test]
    fn test_chunked_response() {
        let ev = events_for(&[
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"5\r\nhello\r\n0\r\n\r\n",
        ]);
        assert_eq!(
            vec![
                "begin",
                "field:Transfer-Encoding",
                "value:chunked",
                "headers:200",
                "body:hello",
                "complete"
            ],
            ev
        );
    }

    #[test]
    fn test_pipelined_requests() {
        let ev = events_for(&[b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n"]);
        assert_eq!(
            vec![
                "begin", "url:/a", "headers:0", "complete", "begin", "url:/b", "headers:0",
                "complete"
            ],
            ev
        );
    }

    #[test]
    fn test_read_until_close() {
        let mut parser = Parser::new();
        let mut out = Vec::new();
        parser
            .execute(b"HTTP/1.0 200 OK\r\n\r\nstream", &mut out)
            .unwrap();
        assert!(matches!(out.last(), Some(Event::Body(b"stream"))));
        let mut fin = Vec::new();
        parser.finish(&mut fin);
        assert!(matches!(fin.last(), Some(Event::MessageComplete)));
    }

    #[test]
    fn test_non_http_errors_out() {
        for junk in [
            &b"SSH-2.0-OpenSSH_8.9\r\n"[..],
            &b"220 mx.example ESMTP\r\n"[..],
            &b"HELO there\r\n"[..],
            &b"\x16\x03\x01\x00\x05xxxxx\n"[..],
        ]
        .iter()
        {
            let mut parser = Parser::new();
            let mut out = Vec::new();
            assert!(
                parser.execute(junk, &mut out).is_err(),
                "{:?} should not parse",
                String::from_utf8_lossy(junk)
            );
        }
    }

    #[test]
    fn test_folded_header_value() {
        let ev = events_for(&[b"GET / HTTP/1.1\r\nX-A: one\r\n two\r\n\r\n"]);
        assert!(ev.contains(&"value:one two".to_string()));
    }
}
