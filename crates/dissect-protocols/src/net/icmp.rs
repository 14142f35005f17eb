//! ICMPv4 dissector.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use crate::net::checksum;
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`IcmpResult`].
pub const RESULT_KEY: &str = "icmp_result";

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_SOURCE_QUENCH: u8 = 4;
pub const TYPE_REDIRECT: u8 = 5;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_TIME_EXCEEDED: u8 = 11;
pub const TYPE_PARAM_PROBLEM: u8 = 12;
pub const TYPE_TIMESTAMP_REQUEST: u8 = 13;
pub const TYPE_TIMESTAMP_REPLY: u8 = 14;

const HEADER_SIZE: usize = 8;

/// Decoded ICMP message.
///
/// `rest` is the raw third word; the accessors reinterpret it per type.
#[derive(Debug, Clone)]
pub struct IcmpResult<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: u32,
    pub checksum_valid: bool,
    pub payload: ByteSlice<'a>,
}

impl IcmpResult<'_> {
    /// Identifier for echo request/reply.
    pub fn echo_id(&self) -> u16 {
        (self.rest >> 16) as u16
    }

    /// Sequence number for echo request/reply.
    pub fn echo_seq(&self) -> u16 {
        self.rest as u16
    }

    /// Next-hop MTU for "fragmentation needed".
    pub fn mtu(&self) -> u16 {
        self.rest as u16
    }

    /// Gateway address for redirects.
    pub fn gateway(&self) -> std::net::Ipv4Addr {
        std::net::Ipv4Addr::from(self.rest)
    }

    pub fn is_error_message(&self) -> bool {
        matches!(
            self.icmp_type,
            TYPE_DEST_UNREACHABLE
                | TYPE_SOURCE_QUENCH
                | TYPE_REDIRECT
                | TYPE_TIME_EXCEEDED
                | TYPE_PARAM_PROBLEM
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self.icmp_type {
            TYPE_ECHO_REPLY => "Echo Reply",
            TYPE_DEST_UNREACHABLE => "Destination Unreachable",
            TYPE_SOURCE_QUENCH => "Source Quench",
            TYPE_REDIRECT => "Redirect",
            TYPE_ECHO_REQUEST => "Echo Request",
            TYPE_TIME_EXCEEDED => "Time Exceeded",
            TYPE_PARAM_PROBLEM => "Parameter Problem",
            TYPE_TIMESTAMP_REQUEST => "Timestamp Request",
            TYPE_TIMESTAMP_REPLY => "Timestamp Reply",
            _ => "Unknown",
        }
    }
}

/// ICMPv4 dissector. The checksum covers the entire ICMP segment.
pub struct IcmpDissector {
    machine: StateMachine,
    error: String,
}

impl IcmpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "ICMP message shorter than 8 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        self.machine.advance(ParsePhase::Parsing);

        let result = IcmpResult {
            icmp_type: buf.read_u8(0),
            code: buf.read_u8(1),
            checksum: buf.read_be16(2),
            rest: buf.read_be32(4),
            checksum_valid: checksum::verify(buf.as_bytes()),
            payload: buf.slice_from(HEADER_SIZE),
        };
        if !result.checksum_valid {
            tracing::warn!(icmp_type = result.icmp_type, "ICMP checksum mismatch");
        }

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Icmp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for IcmpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for IcmpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "ICMP",
            protocol_id: 1,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= HEADER_SIZE && (buffer.read_u8(0) <= 18 || buffer.read_u8(0) == 30)
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
