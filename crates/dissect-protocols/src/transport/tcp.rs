//! TCP dissector with typed option decoding.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`TcpResult`].
pub const RESULT_KEY: &str = "tcp_result";

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;
pub const FLAG_URG: u8 = 0x20;
pub const FLAG_ECE: u8 = 0x40;
pub const FLAG_CWR: u8 = 0x80;

pub const OPT_END_OF_OPTIONS: u8 = 0;
pub const OPT_NO_OPERATION: u8 = 1;
pub const OPT_MSS: u8 = 2;
pub const OPT_WINDOW_SCALE: u8 = 3;
pub const OPT_SACK_PERMITTED: u8 = 4;
pub const OPT_SACK: u8 = 5;
pub const OPT_TIMESTAMP: u8 = 8;

const MIN_HEADER: usize = 20;

/// One TCP option, single-byte kinds included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub length: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    /// Maximum segment size (option kind 2).
    pub fn as_mss(&self) -> Option<u16> {
        (self.kind == OPT_MSS && self.data.len() == 2)
            .then(|| u16::from_be_bytes([self.data[0], self.data[1]]))
    }

    /// Window scale shift count (option kind 3).
    pub fn as_window_scale(&self) -> Option<u8> {
        (self.kind == OPT_WINDOW_SCALE && self.data.len() == 1).then(|| self.data[0])
    }

    /// `(TSval, TSecr)` for option kind 8.
    pub fn as_timestamp(&self) -> Option<(u32, u32)> {
        (self.kind == OPT_TIMESTAMP && self.data.len() == 8).then(|| {
            (
                u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]),
                u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]),
            )
        })
    }

    /// `(left, right)` edges for option kind 5.
    pub fn as_sack_blocks(&self) -> Option<Vec<(u32, u32)>> {
        if self.kind != OPT_SACK || self.data.len() % 8 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| {
                    (
                        u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                        u32::from_be_bytes([c[4], c[5], c[6], c[7]]),
                    )
                })
                .collect(),
        )
    }
}

/// Re-encode an option list exactly as parsed.
pub fn serialize_options(options: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        match option.kind {
            OPT_END_OF_OPTIONS | OPT_NO_OPERATION => out.push(option.kind),
            _ => {
                out.push(option.kind);
                out.push(option.length);
                out.extend_from_slice(&option.data);
            }
        }
    }
    out
}

/// Decoded TCP header plus payload view.
#[derive(Debug, Clone)]
pub struct TcpResult<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset_flags: u8,
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub options: Vec<TcpOption>,
    pub payload: ByteSlice<'a>,
}

impl TcpResult<'_> {
    /// Header length in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        self.data_offset_flags >> 4
    }

    pub fn header_length(&self) -> usize {
        usize::from(self.data_offset()) * 4
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has_flag(FLAG_SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.has_flag(FLAG_FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.has_flag(FLAG_RST)
    }

    pub fn is_ack(&self) -> bool {
        self.has_flag(FLAG_ACK)
    }
}

/// TCP dissector.
pub struct TcpDissector {
    machine: StateMachine,
    error: String,
}

impl TcpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < MIN_HEADER {
            self.error = "TCP segment shorter than 20 bytes".into();
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        let data_offset_flags = buf.read_u8(12);
        let data_offset = data_offset_flags >> 4;
        if !(5..=15).contains(&data_offset) {
            self.error = format!("TCP data offset {data_offset} out of range");
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }
        let header_length = usize::from(data_offset) * 4;
        if buf.len() < header_length {
            self.error = "TCP options truncated".into();
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        self.machine.advance(ParsePhase::Parsing);

        let mut options = Vec::new();
        if let Err(outcome) = walk_options(&buf, MIN_HEADER, header_length, &mut options) {
            self.error = "malformed TCP option".into();
            self.machine.fail();
            return outcome;
        }

        let result = TcpResult {
            src_port: buf.read_be16(0),
            dst_port: buf.read_be16(2),
            seq: buf.read_be32(4),
            ack: buf.read_be32(8),
            data_offset_flags,
            flags: buf.read_u8(13),
            window_size: buf.read_be16(14),
            checksum: buf.read_be16(16),
            urgent_ptr: buf.read_be16(18),
            options,
            payload: buf.slice_from(header_length),
        };

        ctx.offset += header_length;
        ctx.deposit(RESULT_KEY, LayerOutput::Tcp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

fn walk_options(
    buf: &ByteSlice<'_>,
    start: usize,
    end: usize,
    options: &mut Vec<TcpOption>,
) -> Result<(), ParseOutcome> {
    let mut offset = start;
    while offset < end {
        let kind = buf.read_u8(offset);

        if kind == OPT_END_OF_OPTIONS {
            options.push(TcpOption {
                kind,
                length: 1,
                data: Vec::new(),
            });
            break;
        }
        if kind == OPT_NO_OPERATION {
            options.push(TcpOption {
                kind,
                length: 1,
                data: Vec::new(),
            });
            offset += 1;
            continue;
        }

        if offset + 1 >= end {
            return Err(ParseOutcome::InvalidFormat);
        }
        let length = buf.read_u8(offset + 1);
        if length < 2 || offset + usize::from(length) > end {
            return Err(ParseOutcome::InvalidFormat);
        }
        options.push(TcpOption {
            kind,
            length,
            data: buf.as_bytes()[offset + 2..offset + usize::from(length)].to_vec(),
        });
        offset += usize::from(length);
    }
    Ok(())
}

impl Default for TcpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for TcpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "TCP",
            protocol_id: 6,
            header_size: MIN_HEADER,
            min_packet_size: MIN_HEADER,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= MIN_HEADER
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
    use proptest::prelude::*;

    fn segment(flags: u8, options: &[u8], payload: &[u8]) -> Vec<u8> {
        assert!(options.len() % 4 == 0);
        let data_offset = 5 + options.len() / 4;
        let mut s = Vec::new();
        s.extend_from_slice(&12345u16.to_be_bytes());
        s.extend_from_slice(&80u16.to_be_bytes());
        s.extend_from_slice(&1000u32.to_be_bytes());
        s.extend_from_slice(&0u32.to_be_bytes());
        s.push((data_offset as u8) << 4);
        s.push(flags);
        s.extend_from_slice(&65535u16.to_be_bytes());
        s.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
        s.extend_from_slice(options);
        s.extend_from_slice(payload);
        s
    }

    #[test]
    fn test_syn_segment() {
        let data = segment(FLAG_SYN, &[], &[]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = TcpDissector::new();

        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_tcp().unwrap();
        assert_eq!(r.src_port, 12345);
        assert_eq!(r.dst_port, 80);
        assert_eq!(r.seq, 1000);
        assert!(r.is_syn());
        assert!(!r.is_ack());
        assert!(r.payload.is_empty());
    }

    #[test]
    fn test_option_decoding() {
        // MSS 1460, NoOp, WScale 7, SackPermitted, EOL + pad handled by walk.
        let options = [2, 4, 0x05, 0xB4, 1, 3, 3, 7, 4, 2, 0, 0];
        let data = segment(FLAG_SYN, &options, &[]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = TcpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);

        let r = ctx.get(RESULT_KEY).unwrap().as_tcp().unwrap();
        let mss = r.options.iter().find_map(|o| o.as_mss());
        assert_eq!(mss, Some(1460));
        let wscale = r.options.iter().find_map(|o| o.as_window_scale());
        assert_eq!(wscale, Some(7));
        assert!(r.options.iter().any(|o| o.kind == OPT_SACK_PERMITTED));
    }

    #[test]
    fn test_option_roundtrip() {
        let options = [2, 4, 0x05, 0xB4, 1, 1, 8, 10, 0, 0, 0, 1, 0, 0, 0, 2];
        let data = segment(FLAG_ACK, &options, b"x");
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = TcpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_tcp().unwrap();
        assert_eq!(serialize_options(&r.options), options);
    }

    #[test]
    fn test_bad_option_length() {
        let options = [2, 1, 0, 0]; // length 1 is invalid for kind 2
        let data = segment(FLAG_SYN, &options, &[]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            TcpDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }

    #[test]
    fn test_bad_data_offset() {
        let mut data = segment(FLAG_SYN, &[], &[]);
        data[12] = 0x40; // data offset 4
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            TcpDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }

    proptest! {
        #[test]
        fn prop_option_roundtrip(kinds in proptest::collection::vec(2u8..20, 0..4),
                                 payloads in proptest::collection::vec(
                                     proptest::collection::vec(any::<u8>(), 0..6), 0..4)) {
            // Build a well-formed option list, pad to a 4-byte boundary with
            // NoOps, then verify parse -> serialize reproduces the bytes.
            let mut raw = Vec::new();
            for (kind, data) in kinds.iter().zip(payloads.iter()) {
                raw.push(*kind);
                raw.push((data.len() + 2) as u8);
                raw.extend_from_slice(data);
            }
            while raw.len() % 4 != 0 {
                raw.push(OPT_NO_OPERATION);
            }
            prop_assume!(raw.len() <= 40);

            let data = segment(FLAG_ACK, &raw, &[]);
            let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
            let mut dissector = TcpDissector::new();
            prop_assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
            let r = ctx.get(RESULT_KEY).unwrap().as_tcp().unwrap();
            prop_assert_eq!(serialize_options(&r.options), raw);
        }
    }
}
