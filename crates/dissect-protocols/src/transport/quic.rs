//! QUIC header dissector (long/short header discrimination only; payload
//! protection makes everything past the header opaque).

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`QuicResult`].
pub const RESULT_KEY: &str = "quic_result";

/// Long-header packet types (bits 4-5 of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    Short,
}

/// Decoded QUIC invariant header.
#[derive(Debug, Clone)]
pub struct QuicResult<'a> {
    pub is_long_header: bool,
    pub packet_type: QuicPacketType,
    /// Zero for short headers and version negotiation.
    pub version: u32,
    pub dcid: Vec<u8>,
    /// Empty for short headers, whose connection-id length is out of band.
    pub scid: Vec<u8>,
    pub payload: ByteSlice<'a>,
}

/// QUIC dissector.
pub struct QuicDissector {
    machine: StateMachine,
    error: String,
}

impl QuicDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.is_empty() {
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let first = buf.read_u8(0);
        // The fixed bit must be set in every QUIC version 1 packet.
        if first & 0x40 == 0 {
            self.error = "QUIC fixed bit clear".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        self.machine.advance(ParsePhase::Parsing);

        let result = if first & 0x80 != 0 {
            if buf.len() < 7 {
                self.machine.fail();
                return ParseOutcome::NeedMoreData;
            }
            let version = buf.read_be32(1);
            let dcid_len = usize::from(buf.read_u8(5));
            if !buf.can_read(dcid_len + 1, 6) {
                self.machine.fail();
                return ParseOutcome::NeedMoreData;
            }
            let dcid = buf.as_bytes()[6..6 + dcid_len].to_vec();
            let scid_off = 6 + dcid_len;
            let scid_len = usize::from(buf.read_u8(scid_off));
            if !buf.can_read(scid_len, scid_off + 1) {
                self.machine.fail();
                return ParseOutcome::NeedMoreData;
            }
            let scid = buf.as_bytes()[scid_off + 1..scid_off + 1 + scid_len].to_vec();

            let packet_type = if version == 0 {
                QuicPacketType::VersionNegotiation
            } else {
                match (first >> 4) & 0x03 {
                    0 => QuicPacketType::Initial,
                    1 => QuicPacketType::ZeroRtt,
                    2 => QuicPacketType::Handshake,
                    _ => QuicPacketType::Retry,
                }
            };

            QuicResult {
                is_long_header: true,
                packet_type,
                version,
                dcid,
                scid,
                payload: buf.slice_from(scid_off + 1 + scid_len),
            }
        } else {
            QuicResult {
                is_long_header: false,
                packet_type: QuicPacketType::Short,
                version: 0,
                dcid: Vec::new(),
                scid: Vec::new(),
                payload: buf.slice_from(1),
            }
        };

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Quic(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for QuicDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for QuicDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "QUIC",
            protocol_id: 443,
            header_size: 1,
            min_packet_size: 1,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        !buffer.is_empty() && buffer.read_u8(0) & 0x40 != 0
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
    fn test_initial_long_header() {
        let mut p = vec![0xC0]; // long header, Initial
        p.extend_from_slice(&1u32.to_be_bytes());
        p.push(4);
        p.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        p.push(2);
        p.extend_from_slice(&[0x11, 0x22]);
        p.extend_from_slice(&[0u8; 8]);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        let mut dissector = QuicDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_quic().unwrap();
        assert!(r.is_long_header);
        assert_eq!(r.packet_type, QuicPacketType::Initial);
        assert_eq!(r.version, 1);
        assert_eq!(r.dcid, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(r.scid, &[0x11, 0x22]);
    }

    #[test]
    fn test_version_negotiation() {
        let mut p = vec![0xC0];
        p.extend_from_slice(&0u32.to_be_bytes());
        p.push(0);
        p.push(0);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        let mut dissector = QuicDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_quic().unwrap();
        assert_eq!(r.packet_type, QuicPacketType::VersionNegotiation);
    }

    #[test]
    fn test_short_header() {
        let p = [0x40, 1, 2, 3];
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        let mut dissector = QuicDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_quic().unwrap();
        assert!(!r.is_long_header);
        assert_eq!(r.packet_type, QuicPacketType::Short);
    }

    #[test]
    fn test_fixed_bit_clear_rejected() {
        let p = [0x00, 1, 2];
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        assert_eq!(
            QuicDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }
}
