//! IPv6 dissector with extension-header chain walking.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;
use std::net::Ipv6Addr;

/// Metadata key for the deposited [`Ipv6Result`].
pub const RESULT_KEY: &str = "ipv6_result";

const HEADER_SIZE: usize = 40;

const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_ESP: u8 = 50;
const EXT_AH: u8 = 51;
const EXT_DST_OPTS: u8 = 60;
const EXT_MOBILITY: u8 = 135;

/// True for the extension-header types the chain walker consumes.
pub fn is_extension_header(next_header: u8) -> bool {
    matches!(
        next_header,
        EXT_HOP_BY_HOP
            | EXT_ROUTING
            | EXT_FRAGMENT
            | EXT_ESP
            | EXT_AH
            | EXT_DST_OPTS
            | EXT_MOBILITY
    )
}

/// One walked extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHeader {
    pub header_type: u8,
    pub length: usize,
}

/// Decoded IPv6 header plus the walked extension chain.
#[derive(Debug, Clone)]
pub struct Ipv6Result<'a> {
    pub version_class_flow: u32,
    pub payload_length: u16,
    /// First non-extension next-header value after the chain walk.
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub extensions: Vec<ExtensionHeader>,
    /// Fixed header plus all walked extension headers, in bytes.
    pub header_length: usize,
    pub payload: ByteSlice<'a>,
}

impl Ipv6Result<'_> {
    pub fn version(&self) -> u8 {
        (self.version_class_flow >> 28) as u8
    }

    pub fn traffic_class(&self) -> u8 {
        (self.version_class_flow >> 20) as u8
    }

    pub fn flow_label(&self) -> u32 {
        self.version_class_flow & 0x000F_FFFF
    }
}

pub fn is_loopback(addr: Ipv6Addr) -> bool {
    addr == Ipv6Addr::LOCALHOST
}

pub fn is_unspecified(addr: Ipv6Addr) -> bool {
    addr == Ipv6Addr::UNSPECIFIED
}

pub fn is_multicast(addr: Ipv6Addr) -> bool {
    addr.octets()[0] == 0xFF
}

pub fn is_link_local(addr: Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xFE && o[1] & 0xC0 == 0x80
}

/// IPv6 dissector.
pub struct Ipv6Dissector {
    machine: StateMachine,
    error: String,
}

impl Ipv6Dissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "IPv6 packet shorter than 40 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let version_class_flow = buf.read_be32(0);
        if version_class_flow >> 28 != 6 {
            self.error = format!("IP version {} is not 6", version_class_flow >> 28);
            self.machine.fail();
            return ParseOutcome::UnsupportedVersion;
        }

        let payload_length = buf.read_be16(4);
        let mut next_header = buf.read_u8(6);
        let hop_limit = buf.read_u8(7);

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf.as_bytes()[8..24]);
        dst.copy_from_slice(&buf.as_bytes()[24..40]);

        self.machine.advance(ParsePhase::Parsing);

        // Walk the extension chain, bounded by the declared payload length
        // so a crafted chain cannot run past the datagram.
        let walk_limit = buf
            .len()
            .min(HEADER_SIZE + usize::from(payload_length));
        let mut offset = HEADER_SIZE;
        let mut extensions = Vec::new();
        while is_extension_header(next_header) && offset + 2 <= walk_limit {
            let chain_next = buf.read_u8(offset);
            let ext_len = buf.read_u8(offset + 1);
            let header_size = if next_header == EXT_FRAGMENT {
                8
            } else {
                (usize::from(ext_len) + 1) * 8
            };
            if offset + header_size > walk_limit {
                break;
            }
            extensions.push(ExtensionHeader {
                header_type: next_header,
                length: header_size,
            });
            offset += header_size;
            next_header = chain_next;
        }

        let payload = buf.slice_from(offset).prefix(
            usize::from(payload_length).saturating_sub(offset - HEADER_SIZE),
        );

        let result = Ipv6Result {
            version_class_flow,
            payload_length,
            next_header,
            hop_limit,
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
            extensions,
            header_length: offset,
            payload,
        };

        ctx.offset += offset;
        ctx.deposit(RESULT_KEY, LayerOutput::Ipv6(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for Ipv6Dissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for Ipv6Dissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "IPv6",
            protocol_id: 0x86DD,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 65535 + HEADER_SIZE,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= HEADER_SIZE && buffer.read_u8(0) >> 4 == 6
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
