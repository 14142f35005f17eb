//! ICMPv6 dissector with Neighbor Discovery option parsing.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use crate::net::checksum;
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`Icmpv6Result`].
pub const RESULT_KEY: &str = "icmpv6_result";

pub const TYPE_DEST_UNREACHABLE: u8 = 1;
pub const TYPE_PACKET_TOO_BIG: u8 = 2;
pub const TYPE_TIME_EXCEEDED: u8 = 3;
pub const TYPE_PARAM_PROBLEM: u8 = 4;
pub const TYPE_ECHO_REQUEST: u8 = 128;
pub const TYPE_ECHO_REPLY: u8 = 129;
pub const TYPE_ROUTER_SOLICITATION: u8 = 133;
pub const TYPE_ROUTER_ADVERTISEMENT: u8 = 134;
pub const TYPE_NEIGHBOR_SOLICITATION: u8 = 135;
pub const TYPE_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const TYPE_REDIRECT: u8 = 137;

const HEADER_SIZE: usize = 8;

/// A Neighbor Discovery option: `{type, length_in_8_byte_units, data}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdOption {
    pub option_type: u8,
    /// Length in 8-byte units, including the two header bytes.
    pub length: u8,
    pub data: Vec<u8>,
}

impl NdOption {
    pub fn name(&self) -> &'static str {
        match self.option_type {
            1 => "Source Link-Layer Address",
            2 => "Target Link-Layer Address",
            3 => "Prefix Information",
            4 => "Redirected Header",
            5 => "MTU",
            _ => "Unknown",
        }
    }
}

/// Decoded ICMPv6 message.
#[derive(Debug, Clone)]
pub struct Icmpv6Result<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: u32,
    /// None when the caller never supplied the IPv6 addresses needed for the
    /// pseudo-header.
    pub checksum_valid: Option<bool>,
    pub nd_options: Vec<NdOption>,
    pub payload: ByteSlice<'a>,
}

impl Icmpv6Result<'_> {
    pub fn is_error_message(&self) -> bool {
        (1..=127).contains(&self.icmp_type)
    }

    pub fn is_neighbor_discovery(&self) -> bool {
        (TYPE_ROUTER_SOLICITATION..=TYPE_REDIRECT).contains(&self.icmp_type)
    }

    pub fn type_name(&self) -> &'static str {
        match self.icmp_type {
            TYPE_DEST_UNREACHABLE => "Destination Unreachable",
            TYPE_PACKET_TOO_BIG => "Packet Too Big",
            TYPE_TIME_EXCEEDED => "Time Exceeded",
            TYPE_PARAM_PROBLEM => "Parameter Problem",
            TYPE_ECHO_REQUEST => "Echo Request",
            TYPE_ECHO_REPLY => "Echo Reply",
            TYPE_ROUTER_SOLICITATION => "Router Solicitation",
            TYPE_ROUTER_ADVERTISEMENT => "Router Advertisement",
            TYPE_NEIGHBOR_SOLICITATION => "Neighbor Solicitation",
            TYPE_NEIGHBOR_ADVERTISEMENT => "Neighbor Advertisement",
            TYPE_REDIRECT => "Redirect",
            _ => "Unknown",
        }
    }
}

/// Bytes between the 8-byte header and the ND option list, per message type.
fn nd_fixed_prefix(icmp_type: u8) -> Option<usize> {
    match icmp_type {
        TYPE_ROUTER_SOLICITATION => Some(0),
        TYPE_ROUTER_ADVERTISEMENT => Some(8),
        TYPE_NEIGHBOR_SOLICITATION | TYPE_NEIGHBOR_ADVERTISEMENT => Some(16),
        TYPE_REDIRECT => Some(32),
        _ => None,
    }
}

/// ICMPv6 dissector.
///
/// The checksum uses the IPv6 pseudo-header, so verification only happens
/// when [`set_addresses`](Self::set_addresses) was called with the enclosing
/// datagram's source and destination.
pub struct Icmpv6Dissector {
    machine: StateMachine,
    error: String,
    addresses: Option<([u8; 16], [u8; 16])>,
}

impl Icmpv6Dissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
            addresses: None,
        }
    }

    /// Supply the enclosing IPv6 addresses for pseudo-header verification.
    pub fn set_addresses(&mut self, src: [u8; 16], dst: [u8; 16]) {
        self.addresses = Some((src, dst));
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "ICMPv6 message shorter than 8 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let icmp_type = buf.read_u8(0);
        self.machine.advance(ParsePhase::Parsing);

        let checksum_valid = self.addresses.map(|(src, dst)| {
            checksum::icmpv6_verify(buf.as_bytes(), &src, &dst, buf.len() as u32)
        });
        if checksum_valid == Some(false) {
            tracing::warn!(icmp_type, "ICMPv6 checksum mismatch");
        }

        let mut nd_options = Vec::new();
        if let Some(prefix) = nd_fixed_prefix(icmp_type) {
            walk_nd_options(&buf, HEADER_SIZE + prefix, &mut nd_options);
        }

        let result = Icmpv6Result {
            icmp_type,
            code: buf.read_u8(1),
            checksum: buf.read_be16(2),
            rest: buf.read_be32(4),
            checksum_valid,
            nd_options,
            payload: buf.slice_from(HEADER_SIZE),
        };

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Icmpv6(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

fn walk_nd_options(buf: &ByteSlice<'_>, start: usize, options: &mut Vec<NdOption>) {
    let mut offset = start;
    while offset + 2 <= buf.len() {
        let option_type = buf.read_u8(offset);
        let length = buf.read_u8(offset + 1);
        // A zero length would never advance; the walk terminates.
        if length == 0 {
            break;
        }
        let option_size = usize::from(length) * 8;
        if offset + option_size > buf.len() {
            break;
        }
        options.push(NdOption {
            option_type,
            length,
            data: buf.as_bytes()[offset + 2..offset + option_size].to_vec(),
        });
        offset += option_size;
    }
}

impl Default for Icmpv6Dissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for Icmpv6Dissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "ICMPv6",
            protocol_id: 58,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        if buffer.len() < HEADER_SIZE {
            return false;
        }
        let t = buffer.read_u8(0);
        (1..=4).contains(&t) || (128..=137).contains(&t)
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
        self.addresses = None;
    }

    fn progress(&self) -> f64 {
        self.machine.progress()
    }

    fn error_message(&self) -> &str {
        &self.error
    }
}
