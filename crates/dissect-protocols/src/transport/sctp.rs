//! SCTP dissector: common header plus chunk walking.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`SctpResult`].
pub const RESULT_KEY: &str = "sctp_result";

const HEADER_SIZE: usize = 12;
const CHUNK_HEADER_SIZE: usize = 4;

/// One chunk header from the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SctpChunk {
    pub chunk_type: u8,
    pub flags: u8,
    /// Unpadded length including the 4-byte chunk header.
    pub length: u16,
}

impl SctpChunk {
    pub fn type_name(&self) -> &'static str {
        match self.chunk_type {
            0 => "DATA",
            1 => "INIT",
            2 => "INIT ACK",
            3 => "SACK",
            4 => "HEARTBEAT",
            5 => "HEARTBEAT ACK",
            6 => "ABORT",
            7 => "SHUTDOWN",
            8 => "SHUTDOWN ACK",
            9 => "ERROR",
            10 => "COOKIE ECHO",
            11 => "COOKIE ACK",
            14 => "SHUTDOWN COMPLETE",
            _ => "Unknown",
        }
    }
}

/// Decoded SCTP common header plus chunk list.
#[derive(Debug, Clone)]
pub struct SctpResult<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub verification_tag: u32,
    pub checksum: u32,
    pub chunks: Vec<SctpChunk>,
    /// Bytes after the last complete chunk, if any.
    pub trailing: ByteSlice<'a>,
}

/// SCTP dissector. Chunks are 4-byte padded; a chunk length below 4 is a
/// hard error.
pub struct SctpDissector {
    machine: StateMachine,
    error: String,
}

impl SctpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "SCTP packet shorter than 12 bytes".into();
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        self.machine.advance(ParsePhase::Parsing);

        let mut chunks = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset + CHUNK_HEADER_SIZE <= buf.len() {
            let length = buf.read_be16(offset + 2);
            if usize::from(length) < CHUNK_HEADER_SIZE {
                self.error = format!("SCTP chunk length {length} below minimum");
                self.machine.fail();
                return ParseOutcome::InvalidFormat;
            }
            let padded = (usize::from(length) + 3) & !3;
            if offset + usize::from(length) > buf.len() {
                break; // truncated final chunk
            }
            chunks.push(SctpChunk {
                chunk_type: buf.read_u8(offset),
                flags: buf.read_u8(offset + 1),
                length,
            });
            offset += padded;
        }

        let result = SctpResult {
            src_port: buf.read_be16(0),
            dst_port: buf.read_be16(2),
            verification_tag: buf.read_be32(4),
            checksum: buf.read_be32(8),
            chunks,
            trailing: buf.slice_from(offset.min(buf.len())),
        };

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Sctp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for SctpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for SctpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "SCTP",
            protocol_id: 132,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= HEADER_SIZE
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

    fn packet(chunks: &[(u8, &[u8])]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&9u16.to_be_bytes());
        p.extend_from_slice(&2905u16.to_be_bytes());
        p.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        p.extend_from_slice(&0u32.to_be_bytes());
        for (chunk_type, data) in chunks {
            p.push(*chunk_type);
            p.push(0);
            p.extend_from_slice(&((data.len() + 4) as u16).to_be_bytes());
            p.extend_from_slice(data);
            while p.len() % 4 != 0 {
                p.push(0);
            }
        }
        p
    }

    #[test]
    fn test_chunk_walk() {
        let data = packet(&[(1, &[0u8; 16]), (0, b"hello")]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = SctpDissector::new();

        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_sctp().unwrap();
        assert_eq!(r.src_port, 9);
        assert_eq!(r.verification_tag, 0xDEADBEEF);
        assert_eq!(r.chunks.len(), 2);
        assert_eq!(r.chunks[0].type_name(), "INIT");
        assert_eq!(r.chunks[1].type_name(), "DATA");
        assert_eq!(r.chunks[1].length, 9); // 4 + "hello", unpadded
    }

    #[test]
    fn test_chunk_length_below_minimum() {
        let mut data = packet(&[(0, b"x")]);
        data[14..16].copy_from_slice(&2u16.to_be_bytes());
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        assert_eq!(
            SctpDissector::new().parse(&mut ctx),
            ParseOutcome::InvalidFormat
        );
    }

    #[test]
    fn test_truncated_chunk_stops_walk() {
        let mut data = packet(&[(0, b"abcd")]);
        data.truncate(data.len() - 2);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = SctpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let r = ctx.get(RESULT_KEY).unwrap().as_sctp().unwrap();
        assert!(r.chunks.is_empty());
    }
}
