//! HTTP/1.x dissector: request/status line and headers via `httparse`, then
//! body framing (Content-Length or chunked transfer encoding).

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`HttpResult`].
pub const RESULT_KEY: &str = "http_result";

const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

const MAX_HEADERS: usize = 64;

/// Decoded HTTP message head plus framed body.
#[derive(Debug, Clone, Default)]
pub struct HttpResult<'a> {
    pub is_request: bool,
    pub method: Option<String>,
    pub path: Option<String>,
    pub version: u8,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    /// Header names lowercased; order preserved.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<usize>,
    pub is_chunked: bool,
    /// Raw body window (identity framing).
    pub body: ByteSlice<'a>,
    /// Decoded chunk slices when `is_chunked`.
    pub body_chunks: Vec<ByteSlice<'a>>,
    /// False when the buffer ended before the framed body did.
    pub body_complete: bool,
}

impl HttpResult<'_> {
    /// Value of `name` (case-insensitive match against stored lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }
}

/// True when the buffer opens with a known request method token.
pub fn looks_like_request(buffer: &ByteSlice<'_>) -> bool {
    let head = buffer.prefix(8);
    let head = head.as_bytes();
    KNOWN_METHODS.iter().any(|m| {
        head.len() > m.len() && head.starts_with(m.as_bytes()) && head[m.len()] == b' '
    })
}

/// HTTP dissector.
pub struct HttpDissector {
    machine: StateMachine,
    error: String,
}

impl HttpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        let bytes = buf.as_bytes();
        if bytes.len() < 16 {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        self.machine.advance(ParsePhase::Parsing);

        let mut result = HttpResult::default();
        let body_offset;

        if looks_like_request(&buf) {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(bytes) {
                Ok(httparse::Status::Complete(offset)) => {
                    result.is_request = true;
                    result.method = req.method.map(str::to_owned);
                    result.path = req.path.map(str::to_owned);
                    result.version = req.version.unwrap_or(1);
                    collect_headers(req.headers, &mut result);
                    body_offset = offset;
                }
                Ok(httparse::Status::Partial) => {
                    self.machine.fail();
                    return ParseOutcome::NeedMoreData;
                }
                Err(_) => {
                    self.error = "malformed HTTP request head".into();
                    self.machine.fail();
                    return ParseOutcome::InvalidFormat;
                }
            }
        } else if buf.starts_with(b"HTTP/") {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(bytes) {
                Ok(httparse::Status::Complete(offset)) => {
                    result.is_request = false;
                    result.version = resp.version.unwrap_or(1);
                    result.status_code = resp.code;
                    result.reason = resp.reason.map(str::to_owned);
                    collect_headers(resp.headers, &mut result);
                    body_offset = offset;
                }
                Ok(httparse::Status::Partial) => {
                    self.machine.fail();
                    return ParseOutcome::NeedMoreData;
                }
                Err(_) => {
                    self.error = "malformed HTTP response head".into();
                    self.machine.fail();
                    return ParseOutcome::InvalidFormat;
                }
            }
        } else {
            self.error = "not an HTTP message".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        let body = buf.slice_from(body_offset);
        if result.is_chunked {
            result.body_complete = decode_chunks(&body, &mut result.body_chunks);
            result.body = body;
        } else if let Some(length) = result.content_length {
            result.body = body.prefix(length);
            result.body_complete = body.len() >= length;
        } else {
            result.body = body;
            result.body_complete = true;
        }

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Http(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

fn collect_headers(headers: &[httparse::Header<'_>], result: &mut HttpResult<'_>) {
    for header in headers {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).into_owned();
        match name.as_str() {
            "content-length" => result.content_length = value.trim().parse().ok(),
            "transfer-encoding" if value.to_ascii_lowercase().contains("chunked") => {
                result.is_chunked = true;
            }
            _ => {}
        }
        result.headers.push((name, value));
    }
}

/// Walk size-prefixed chunks; true when the terminating 0-length chunk was
/// seen inside the buffer.
fn decode_chunks<'a>(body: &ByteSlice<'a>, chunks: &mut Vec<ByteSlice<'a>>) -> bool {
    let mut offset = 0;
    loop {
        let rest = body.slice_from(offset);
        let Some(line_end) = rest.find(b"\r\n") else {
            return false;
        };
        let size_line = &rest.as_bytes()[..line_end];
        let size_str = std::str::from_utf8(size_line)
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return false;
        };
        offset += line_end + 2;
        if size == 0 {
            return true;
        }
        if offset + size > body.len() {
            return false;
        }
        chunks.push(body.slice(offset, size));
        offset += size + 2; // chunk data plus trailing CRLF
    }
}

impl Default for HttpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for HttpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "HTTP",
            protocol_id: 80,
            header_size: 16,
            min_packet_size: 16,
            max_packet_size: usize::MAX,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        looks_like_request(buffer) || buffer.starts_with(b"HTTP/")
    }

    fn parse<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        ctx.phase = ParsePhase::Parsing;
        loop {
            let outcome = match self.machine.phase() {
                ParsePhase::Initial => self.parse_packet(ctx),
                ParsePhase::Parsing => unreachable!("single-step dissector"),
                ParsePhase::Complete | ParsePhase::Error => break,
            };
            if !outcome.is_success() {
                ctx.phase = self.machine.phase();
                return outcome;
            }
        }
        ctx.phase = self.machine.phase();
        ParseOutcome::Success
    }

    fn reset(&mut self) {
        self.machine.reset();
        self.error.clear();
    }

    fn progress(&self) -> f64 {
        self.machine.progress()
    }

    fn error_message(&self) -> &str {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_with_body() {
        let msg = b"POST /login HTTP/1.1\r\nHost: example.com\r\nContent-Length: 9\r\n\r\nuser=abcd";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        let mut dissector = HttpDissector::new();

        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_http().unwrap();
        assert!(r.is_request);
        assert_eq!(r.method.as_deref(), Some("POST"));
        assert_eq!(r.path.as_deref(), Some("/login"));
        assert_eq!(r.host(), Some("example.com"));
        assert_eq!(r.content_length, Some(9));
        assert_eq!(r.body.as_bytes(), b"user=abcd");
        assert!(r.body_complete);
    }

    #[test]
    fn test_response() {
        let msg = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        let mut dissector = HttpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_http().unwrap();
        assert!(!r.is_request);
        assert_eq!(r.status_code, Some(404));
        assert_eq!(r.reason.as_deref(), Some("Not Found"));
        assert!(r.body_complete);
    }

    #[test]
    fn test_chunked_body() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                    5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        let mut dissector = HttpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_http().unwrap();
        assert!(r.is_chunked);
        assert!(r.body_complete);
        assert_eq!(r.body_chunks.len(), 2);
        assert_eq!(r.body_chunks[0].as_bytes(), b"hello");
        assert_eq!(r.body_chunks[1].as_bytes(), b" world");
    }

    #[test]
    fn test_incomplete_chunked_body() {
        let msg = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        let mut dissector = HttpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_http().unwrap();
        assert!(!r.body_complete);
    }

    #[test]
    fn test_partial_head_needs_more() {
        let msg = b"GET /index.html HTTP/1.1\r\nHost: exa";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        assert_eq!(
            HttpDissector::new().parse(&mut ctx),
            ParseOutcome::NeedMoreData
        );
    }

    #[test]
    fn test_not_http() {
        let msg = b"\x16\x03\x03\x00\x40aaaaaaaaaaaaaaaa";
        let mut ctx = ParseContext::new(ByteSlice::borrowed(msg));
        assert_eq!(
            HttpDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }
}
