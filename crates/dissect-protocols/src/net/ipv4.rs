//! IPv4 dissector: fixed header, options walk, RFC 1071 header checksum.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use crate::net::checksum;
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;
use std::net::Ipv4Addr;

/// Metadata key for the deposited [`Ipv4Result`].
pub const RESULT_KEY: &str = "ipv4_result";

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ESP: u8 = 50;
pub const PROTO_AH: u8 = 51;
pub const PROTO_SCTP: u8 = 132;

const MIN_HEADER: usize = 20;
const MAX_HEADER: usize = 60;

/// A single IPv4 option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Option {
    pub kind: u8,
    pub length: u8,
    pub data: Vec<u8>,
}

impl Ipv4Option {
    pub fn name(&self) -> &'static str {
        match self.kind {
            0 => "End of Options List",
            1 => "No Operation",
            2 => "Security",
            3 => "Loose Source Routing",
            4 => "Timestamp",
            7 => "Record Route",
            8 => "Stream ID",
            9 => "Strict Source Routing",
            _ => "Unknown",
        }
    }
}

/// Decoded IPv4 header plus payload view.
#[derive(Debug, Clone)]
pub struct Ipv4Result<'a> {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<Ipv4Option>,
    pub checksum_valid: bool,
    pub payload: ByteSlice<'a>,
}

impl Ipv4Result<'_> {
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in bytes (IHL x 4).
    pub fn header_length(&self) -> usize {
        usize::from(self.version_ihl & 0x0F) * 4
    }

    pub fn dscp(&self) -> u8 {
        self.tos >> 2
    }

    pub fn ecn(&self) -> u8 {
        self.tos & 0x03
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment & 0x4000 != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.flags_fragment & 0x2000 != 0
    }

    /// Fragment offset in bytes (13-bit field x 8).
    pub fn fragment_offset(&self) -> usize {
        usize::from(self.flags_fragment & 0x1FFF) * 8
    }

    /// Fragmented packets are recognized; reassembly is a collaborator's job.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }
}

/// Address-class helpers shared with the detection layer.
pub fn is_private(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

pub fn is_multicast(addr: Ipv4Addr) -> bool {
    (224..=239).contains(&addr.octets()[0])
}

pub fn is_broadcast(addr: Ipv4Addr) -> bool {
    addr.octets() == [255, 255, 255, 255]
}

pub fn is_loopback(addr: Ipv4Addr) -> bool {
    addr.octets()[0] == 127
}

/// IPv4 dissector.
pub struct Ipv4Dissector {
    machine: StateMachine,
    error: String,
    verify_checksum: bool,
    parse_options: bool,
}

impl Ipv4Dissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
            verify_checksum: true,
            parse_options: true,
        }
    }

    pub fn set_verify_checksum(&mut self, enabled: bool) {
        self.verify_checksum = enabled;
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < MIN_HEADER {
            self.error = "IPv4 packet shorter than 20 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let version_ihl = buf.read_u8(0);
        if version_ihl >> 4 != 4 {
            self.error = format!("IP version {} is not 4", version_ihl >> 4);
            self.machine.fail();
            return ParseOutcome::UnsupportedVersion;
        }

        let header_length = usize::from(version_ihl & 0x0F) * 4;
        if !(MIN_HEADER..=MAX_HEADER).contains(&header_length) {
            self.error = format!("IHL {} out of range", version_ihl & 0x0F);
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }
        if buf.len() < header_length {
            self.error = "IPv4 options truncated".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let total_length = buf.read_be16(2);
        if usize::from(total_length) < header_length {
            self.error = "IPv4 total length shorter than header".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        let src_bytes = buf.read_be32(12).to_be_bytes();
        let dst_bytes = buf.read_be32(16).to_be_bytes();

        let checksum_valid = if self.verify_checksum {
            let valid = checksum::verify(&buf.as_bytes()[..header_length]);
            if !valid {
                tracing::warn!("IPv4 header checksum mismatch");
            }
            valid
        } else {
            true
        };

        self.machine.advance(ParsePhase::Parsing);

        let mut options = Vec::new();
        if self.parse_options && header_length > MIN_HEADER {
            if let Err(outcome) = walk_options(&buf, MIN_HEADER, header_length, &mut options) {
                self.error = "malformed IPv4 option".into();
                self.machine.fail();
                return outcome;
            }
        }

        // Truncated captures expose whatever payload bytes survive.
        let payload_length =
            (usize::from(total_length) - header_length).min(buf.len() - header_length);
        let payload = buf.slice(header_length, payload_length);

        let result = Ipv4Result {
            version_ihl,
            tos: buf.read_u8(1),
            total_length,
            identification: buf.read_be16(4),
            flags_fragment: buf.read_be16(6),
            ttl: buf.read_u8(8),
            protocol: buf.read_u8(9),
            checksum: buf.read_be16(10),
            src: Ipv4Addr::from(src_bytes),
            dst: Ipv4Addr::from(dst_bytes),
            options,
            checksum_valid,
            payload,
        };

        ctx.offset += header_length;
        ctx.deposit(RESULT_KEY, LayerOutput::Ipv4(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

fn walk_options(
    buf: &ByteSlice<'_>,
    start: usize,
    end: usize,
    options: &mut Vec<Ipv4Option>,
) -> Result<(), ParseOutcome> {
    let mut offset = start;
    while offset < end {
        let kind = buf.read_u8(offset);
        offset += 1;

        // End of Options List / No Operation are single bytes.
        if kind == 0 || kind == 1 {
            options.push(Ipv4Option {
                kind,
                length: 1,
                data: Vec::new(),
            });
            if kind == 0 {
                break;
            }
            continue;
        }

        if offset >= end {
            return Err(ParseOutcome::InvalidFormat);
        }
        let length = buf.read_u8(offset);
        offset += 1;
        if length < 2 || usize::from(length) > end - (offset - 2) {
            return Err(ParseOutcome::InvalidFormat);
        }
        let data_len = usize::from(length) - 2;
        options.push(Ipv4Option {
            kind,
            length,
            data: buf.as_bytes()[offset..offset + data_len].to_vec(),
        });
        offset += data_len;
    }
    Ok(())
}

impl Default for Ipv4Dissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for Ipv4Dissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "IPv4",
            protocol_id: 0x0800,
            header_size: MIN_HEADER,
            min_packet_size: MIN_HEADER,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= MIN_HEADER && buffer.read_u8(0) >> 4 == 4
    }

    fn parse<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        ctx.phase = ParsePhase::Parsing;
        loop {
            let outcome = match self.machine.phase() {
                ParsePhase::Initial => self.parse_packet(ctx),
                // parse_packet runs header + options + payload in one pass.
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
    use crate::net::checksum::fill;

    fn header(protocol: u8, payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut h = vec![
            0x45, 0x00, 0, 0, // version/ihl, tos, total_length
            0x12, 0x34, 0x40, 0x00, // id, flags (DF)
            0x40, protocol, 0x00, 0x00, // ttl, proto, checksum
            10, 0, 0, 1, // src
            10, 0, 0, 2, // dst
        ];
        h[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        fill(&mut h[..20], 10);
        h.extend_from_slice(payload);
        h
    }

    #[test]
    fn test_parse_valid_header() {
        let data = header(PROTO_TCP, &[1, 2, 3, 4]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = Ipv4Dissector::new();

        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_ipv4().unwrap();
        assert_eq!(r.version(), 4);
        assert_eq!(r.header_length(), 20);
        assert_eq!(r.protocol, PROTO_TCP);
        assert_eq!(r.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(r.dst, Ipv4Addr::new(10, 0, 0, 2));
        assert!(r.checksum_valid);
        assert!(r.dont_fragment());
        assert!(!r.is_fragment());
        assert_eq!(r.payload.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(ctx.offset, 20);
    }

    #[test]
    fn test_bit_flip_invalidates_checksum() {
        let mut data = header(PROTO_UDP, &[]);
        data[8] ^= 0x04; // flip a TTL bit
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = Ipv4Dissector::new();

        // Checksum mismatch is recorded but not fatal.
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_ipv4().unwrap();
        assert!(!r.checksum_valid);
    }

    #[test]
    fn test_bad_version() {
        let mut data = header(PROTO_TCP, &[]);
        data[0] = 0x65;
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            Ipv4Dissector::new().parse(&mut ctx),
            ParseOutcome::UnsupportedVersion
        );
    }

    #[test]
    fn test_ihl_bounds() {
        for ihl in 0u8..=15 {
            let mut data = header(PROTO_TCP, &[0u8; 44]);
            data[0] = 0x40 | ihl;
            fill(&mut data[..20], 10);
            let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
            let outcome = Ipv4Dissector::new().parse(&mut ctx);
            if ihl < 5 {
                assert_eq!(outcome, ParseOutcome::InvalidFormat, "ihl {ihl}");
            } else {
                assert_eq!(outcome, ParseOutcome::Success, "ihl {ihl}");
            }
        }
    }

    #[test]
    fn test_options_walk() {
        // IHL 6: 20-byte header + 4 option bytes (NoOp, NoOp, EOL, pad).
        let mut data = vec![
            0x46, 0x00, 0x00, 0x18, 0x00, 0x01, 0x00, 0x00, 0x40, PROTO_TCP, 0x00, 0x00, 10, 0, 0,
            1, 10, 0, 0, 2, 0x01, 0x01, 0x00, 0x00,
        ];
        fill(&mut data[..24], 10);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = Ipv4Dissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_ipv4().unwrap();
        assert_eq!(r.options.len(), 3);
        assert_eq!(r.options[0].kind, 1);
        assert_eq!(r.options[2].kind, 0);
    }

    #[test]
    fn test_total_length_shorter_than_header() {
        let mut data = header(PROTO_TCP, &[]);
        data[2..4].copy_from_slice(&10u16.to_be_bytes());
        fill(&mut data[..20], 10);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            Ipv4Dissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }

    #[test]
    fn test_address_classes() {
        assert!(is_private(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(is_private(Ipv4Addr::new(172, 20, 0, 1)));
        assert!(is_private(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(is_multicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_broadcast(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(is_loopback(Ipv4Addr::new(127, 0, 0, 1)));
    }
}
