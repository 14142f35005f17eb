//! gRPC dissector: HTTP/2 frame header, a minimal HPACK literal decoder for
//! HEADERS frames, and length-prefixed gRPC messages inside DATA frames.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`GrpcResult`].
pub const RESULT_KEY: &str = "grpc_result";

const FRAME_HEADER_SIZE: usize = 9;
const MAX_FRAME_SIZE: u32 = 16_777_215;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_END_STREAM: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;
pub const FLAG_PADDED: u8 = 0x08;
pub const FLAG_PRIORITY: u8 = 0x20;

/// HTTP/2 frame header: `{length(24), type(8), flags(8), stream_id(31)}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl Http2FrameHeader {
    pub fn type_name(&self) -> &'static str {
        match self.frame_type {
            FRAME_DATA => "DATA",
            FRAME_HEADERS => "HEADERS",
            0x2 => "PRIORITY",
            0x3 => "RST_STREAM",
            FRAME_SETTINGS => "SETTINGS",
            0x5 => "PUSH_PROMISE",
            FRAME_PING => "PING",
            FRAME_GOAWAY => "GOAWAY",
            FRAME_WINDOW_UPDATE => "WINDOW_UPDATE",
            0x9 => "CONTINUATION",
            _ => "Unknown",
        }
    }
}

/// One length-prefixed gRPC message from a DATA frame.
#[derive(Debug, Clone)]
pub struct GrpcMessage<'a> {
    pub compressed: bool,
    pub length: u32,
    pub body: ByteSlice<'a>,
}

/// Decoded gRPC-over-HTTP/2 frame.
#[derive(Debug, Clone, Default)]
pub struct GrpcResult<'a> {
    pub frame: Option<Http2FrameHeader>,
    /// Decoded header list for HEADERS frames (Huffman-coded literals are
    /// skipped by the minimal decoder).
    pub headers: Vec<(String, String)>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub authority: Option<String>,
    /// Service name from a `/pkg.Service/Method` path.
    pub service: Option<String>,
    /// Method name from a `/pkg.Service/Method` path.
    pub method_name: Option<String>,
    pub messages: Vec<GrpcMessage<'a>>,
    pub is_end_stream: bool,
    pub is_end_headers: bool,
}

/// RFC 7541 Appendix A static table.
static HPACK_STATIC: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

fn static_entry(index: usize) -> Option<(&'static str, &'static str)> {
    (1..=HPACK_STATIC.len())
        .contains(&index)
        .then(|| HPACK_STATIC[index - 1])
}

/// HPACK prefixed integer (RFC 7541 §5.1).
fn decode_integer(data: &[u8], offset: &mut usize, prefix_bits: u8) -> Option<u64> {
    let mask = (1u16 << prefix_bits) - 1;
    let first = u64::from(*data.get(*offset)?) & u64::from(mask);
    *offset += 1;
    if first < u64::from(mask) {
        return Some(first);
    }
    let mut value = first;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*offset)?;
        *offset += 1;
        if shift >= 63 {
            return None;
        }
        value = value.checked_add(u64::from(byte & 0x7F) << shift)?;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// HPACK string literal; Huffman-coded strings are skipped (None value).
fn decode_string(data: &[u8], offset: &mut usize) -> Option<Option<String>> {
    let huffman = data.get(*offset)? & 0x80 != 0;
    let length = decode_integer(data, offset, 7)? as usize;
    let bytes = data.get(*offset..*offset + length)?;
    *offset += length;
    if huffman {
        return Some(None);
    }
    Some(Some(String::from_utf8_lossy(bytes).into_owned()))
}

/// Minimal HPACK block decoder: indexed fields against the static table and
/// literal fields; dynamic-table references decode to nothing.
fn decode_header_block(data: &[u8]) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let byte = data[offset];
        if byte & 0x80 != 0 {
            // Indexed header field.
            let Some(index) = decode_integer(data, &mut offset, 7) else {
                break;
            };
            if let Some((name, value)) = static_entry(index as usize) {
                headers.push((name.to_owned(), value.to_owned()));
            }
        } else {
            // Literal: prefix width depends on the indexing mode.
            let prefix_bits = if byte & 0x40 != 0 { 6 } else { 4 };
            let Some(name_index) = decode_integer(data, &mut offset, prefix_bits) else {
                break;
            };
            let name = if name_index == 0 {
                match decode_string(data, &mut offset) {
                    Some(Some(n)) => Some(n),
                    Some(None) => None,
                    None => break,
                }
            } else {
                static_entry(name_index as usize).map(|(n, _)| n.to_owned())
            };
            let value = match decode_string(data, &mut offset) {
                Some(v) => v,
                None => break,
            };
            if let (Some(name), Some(value)) = (name, value) {
                headers.push((name, value));
            }
        }
    }
    headers
}

/// gRPC dissector.
pub struct GrpcDissector {
    machine: StateMachine,
    error: String,
}

impl GrpcDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < FRAME_HEADER_SIZE {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        let length = (buf.read_be32(0) >> 8) & 0x00FF_FFFF;
        let frame = Http2FrameHeader {
            length,
            frame_type: buf.read_u8(3),
            flags: buf.read_u8(4),
            stream_id: buf.read_be32(5) & 0x7FFF_FFFF,
        };

        if frame.length > MAX_FRAME_SIZE {
            self.error = "HTTP/2 frame length exceeds maximum".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }
        // HEADERS and DATA frames belong to a stream.
        if frame.stream_id == 0 && matches!(frame.frame_type, FRAME_HEADERS | FRAME_DATA) {
            self.error = "stream 0 cannot carry HEADERS or DATA".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }
        if !buf.can_read(frame.length as usize, FRAME_HEADER_SIZE) {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        self.machine.advance(ParsePhase::Parsing);

        let mut payload = buf.slice(FRAME_HEADER_SIZE, frame.length as usize);
        let mut result = GrpcResult {
            frame: Some(frame),
            is_end_stream: frame.flags & FLAG_END_STREAM != 0,
            is_end_headers: frame.flags & FLAG_END_HEADERS != 0,
            ..GrpcResult::default()
        };

        match frame.frame_type {
            FRAME_HEADERS => {
                if frame.flags & FLAG_PADDED != 0 {
                    let pad = usize::from(payload.read_u8(0));
                    payload = payload.slice(1, payload.len().saturating_sub(1 + pad));
                }
                if frame.flags & FLAG_PRIORITY != 0 {
                    payload = payload.slice_from(5);
                }
                result.headers = decode_header_block(payload.as_bytes());
                for (name, value) in &result.headers {
                    match name.as_str() {
                        ":path" => result.path = Some(value.clone()),
                        ":method" => result.method = Some(value.clone()),
                        ":authority" => result.authority = Some(value.clone()),
                        _ => {}
                    }
                }
                if let Some(path) = &result.path {
                    if let Some((service, method)) =
                        path.strip_prefix('/').and_then(|p| p.split_once('/'))
                    {
                        result.service = Some(service.to_owned());
                        result.method_name = Some(method.to_owned());
                    }
                }
            }
            FRAME_DATA => {
                if frame.flags & FLAG_PADDED != 0 {
                    let pad = usize::from(payload.read_u8(0));
                    payload = payload.slice(1, payload.len().saturating_sub(1 + pad));
                }
                let mut offset = 0;
                while payload.can_read(5, offset) {
                    let compressed = payload.read_u8(offset) != 0;
                    let msg_len = payload.read_be32(offset + 1);
                    if !payload.can_read(msg_len as usize, offset + 5) {
                        break;
                    }
                    result.messages.push(GrpcMessage {
                        compressed,
                        length: msg_len,
                        body: payload.slice(offset + 5, msg_len as usize),
                    });
                    offset += 5 + msg_len as usize;
                }
            }
            _ => {}
        }

        ctx.offset += FRAME_HEADER_SIZE + frame.length as usize;
        ctx.deposit(RESULT_KEY, LayerOutput::Grpc(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for GrpcDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for GrpcDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "gRPC",
            protocol_id: 50051,
            header_size: FRAME_HEADER_SIZE,
            min_packet_size: FRAME_HEADER_SIZE,
            max_packet_size: MAX_FRAME_SIZE as usize + FRAME_HEADER_SIZE,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= FRAME_HEADER_SIZE && buffer.read_u8(3) <= 0x9
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

    fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        let len = payload.len() as u32;
        f.extend_from_slice(&len.to_be_bytes()[1..]);
        f.push(frame_type);
        f.push(flags);
        f.extend_from_slice(&stream_id.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn literal_header(name: &str, value: &str) -> Vec<u8> {
        let mut h = vec![0x40]; // literal with incremental indexing, new name
        h.push(name.len() as u8);
        h.extend_from_slice(name.as_bytes());
        h.push(value.len() as u8);
        h.extend_from_slice(value.as_bytes());
        h
    }

    #[test]
    fn test_headers_frame_with_path() {
        let mut block = vec![0x83]; // indexed: :method POST
        block.extend_from_slice(&literal_header(":path", "/acme.Store/GetItem"));
        block.extend_from_slice(&literal_header(":authority", "store.local"));
        let data = frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = GrpcDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_grpc().unwrap();
        assert_eq!(r.method.as_deref(), Some("POST"));
        assert_eq!(r.path.as_deref(), Some("/acme.Store/GetItem"));
        assert_eq!(r.service.as_deref(), Some("acme.Store"));
        assert_eq!(r.method_name.as_deref(), Some("GetItem"));
        assert_eq!(r.authority.as_deref(), Some("store.local"));
        assert!(r.is_end_headers);
    }

    #[test]
    fn test_data_frame_messages() {
        let mut payload = Vec::new();
        payload.push(0); // uncompressed
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(b"abc");
        payload.push(1); // compressed
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(b"zz");
        let data = frame(FRAME_DATA, FLAG_END_STREAM, 3, &payload);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = GrpcDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_grpc().unwrap();
        assert_eq!(r.messages.len(), 2);
        assert!(!r.messages[0].compressed);
        assert_eq!(r.messages[0].body.as_bytes(), b"abc");
        assert!(r.messages[1].compressed);
        assert!(r.is_end_stream);
    }

    #[test]
    fn test_data_on_stream_zero_rejected() {
        let data = frame(FRAME_DATA, 0, 0, b"xxxxx");
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            GrpcDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }

    #[test]
    fn test_truncated_frame_needs_more() {
        let mut data = frame(FRAME_DATA, 0, 1, &[0u8; 32]);
        data.truncate(20);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            GrpcDissector::new().parse(&mut ctx),
            ParseOutcome::NeedMoreData
        );
    }

    #[test]
    fn test_hpack_integer_overflow_guard() {
        let data = [0x1F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let mut offset = 0;
        assert_eq!(decode_integer(&data, &mut offset, 5), None);
    }
}
