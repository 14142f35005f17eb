//! RTP dissector.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`RtpResult`].
pub const RESULT_KEY: &str = "rtp_result";

const HEADER_SIZE: usize = 12;

/// RTP extension header: profile id plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    /// Length in 32-bit words, excluding the 4-byte extension header.
    pub length: u16,
    pub data: Vec<u8>,
}

/// Decoded RTP header plus payload view.
#[derive(Debug, Clone)]
pub struct RtpResult<'a> {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<RtpExtension>,
    pub payload: ByteSlice<'a>,
}

impl RtpResult<'_> {
    pub fn payload_type_name(&self) -> &'static str {
        match self.payload_type {
            0 => "PCMU",
            8 => "PCMA",
            9 => "G722",
            10 | 11 => "L16",
            14 => "MPA",
            26 => "JPEG",
            31 => "H261",
            32 => "MPV",
            34 => "H263",
            _ => "dynamic",
        }
    }
}

/// RTP dissector. Only version 2 is accepted.
pub struct RtpDissector {
    machine: StateMachine,
    error: String,
}

impl RtpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "RTP packet shorter than 12 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let b0 = buf.read_u8(0);
        let version = b0 >> 6;
        if version != 2 {
            self.error = format!("RTP version {version} unsupported");
            self.machine.fail();
            return ParseOutcome::UnsupportedVersion;
        }

        self.machine.advance(ParsePhase::Parsing);

        let csrc_count = usize::from(b0 & 0x0F);
        let has_extension = b0 & 0x10 != 0;
        let b1 = buf.read_u8(1);

        let mut offset = HEADER_SIZE;
        if !buf.can_read(csrc_count * 4, offset) {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(buf.read_be32(offset));
            offset += 4;
        }

        let mut extension = None;
        if has_extension {
            if !buf.can_read(4, offset) {
                self.machine.fail();
                return ParseOutcome::NeedMoreData;
            }
            let profile = buf.read_be16(offset);
            let length = buf.read_be16(offset + 2);
            let data_len = usize::from(length) * 4;
            if !buf.can_read(data_len, offset + 4) {
                self.machine.fail();
                return ParseOutcome::NeedMoreData;
            }
            extension = Some(RtpExtension {
                profile,
                length,
                data: buf.as_bytes()[offset + 4..offset + 4 + data_len].to_vec(),
            });
            offset += 4 + data_len;
        }

        let result = RtpResult {
            version,
            padding: b0 & 0x20 != 0,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7F,
            sequence: buf.read_be16(2),
            timestamp: buf.read_be32(4),
            ssrc: buf.read_be32(8),
            csrc,
            extension,
            payload: buf.slice_from(offset),
        };

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Rtp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for RtpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for RtpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "RTP",
            protocol_id: 5004,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= HEADER_SIZE && buffer.read_u8(0) >> 6 == 2
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
    fn test_basic_packet() {
        let mut p = vec![0x80, 0x80 | 8]; // v2, marker, PCMA
        p.extend_from_slice(&100u16.to_be_bytes());
        p.extend_from_slice(&160u32.to_be_bytes());
        p.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        p.extend_from_slice(&[1, 2, 3]);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        let mut dissector = RtpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_rtp().unwrap();
        assert_eq!(r.version, 2);
        assert!(r.marker);
        assert_eq!(r.payload_type, 8);
        assert_eq!(r.payload_type_name(), "PCMA");
        assert_eq!(r.sequence, 100);
        assert_eq!(r.ssrc, 0xCAFEBABE);
        assert_eq!(r.payload.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_csrc_and_extension() {
        let mut p = vec![0x80 | 0x10 | 2, 0]; // v2, extension, 2 CSRCs
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&7u32.to_be_bytes());
        p.extend_from_slice(&10u32.to_be_bytes()); // csrc 1
        p.extend_from_slice(&11u32.to_be_bytes()); // csrc 2
        p.extend_from_slice(&0xBEDEu16.to_be_bytes()); // profile
        p.extend_from_slice(&1u16.to_be_bytes()); // 1 word
        p.extend_from_slice(&[0xAA; 4]);
        p.push(0xFF);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        let mut dissector = RtpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_rtp().unwrap();
        assert_eq!(r.csrc, &[10, 11]);
        let ext = r.extension.as_ref().unwrap();
        assert_eq!(ext.profile, 0xBEDE);
        assert_eq!(ext.data, &[0xAA; 4]);
        assert_eq!(r.payload.as_bytes(), &[0xFF]);
    }

    #[test]
    fn test_wrong_version() {
        let p = [0x40u8; 12];
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&p));
        assert_eq!(
            RtpDissector::new().parse(&mut ctx),
            ParseOutcome::UnsupportedVersion
        );
    }
}
