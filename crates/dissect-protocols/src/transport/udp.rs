//! UDP dissector.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`UdpResult`].
pub const RESULT_KEY: &str = "udp_result";

const HEADER_SIZE: usize = 8;

/// Decoded UDP header plus payload view.
#[derive(Debug, Clone)]
pub struct UdpResult<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    /// Datagram length including the 8-byte header.
    pub length: u16,
    pub checksum: u16,
    pub payload: ByteSlice<'a>,
}

/// UDP dissector. The length field must cover the header and fit the slice.
pub struct UdpDissector {
    machine: StateMachine,
    error: String,
}

impl UdpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < HEADER_SIZE {
            self.error = "UDP datagram shorter than 8 bytes".into();
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        let length = buf.read_be16(4);
        if usize::from(length) < HEADER_SIZE {
            self.error = format!("UDP length {length} below header size");
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }
        if usize::from(length) > buf.len() {
            self.error = "UDP length exceeds captured bytes".into();
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }

        self.machine.advance(ParsePhase::Parsing);

        let result = UdpResult {
            src_port: buf.read_be16(0),
            dst_port: buf.read_be16(2),
            length,
            checksum: buf.read_be16(6),
            payload: buf.slice(HEADER_SIZE, usize::from(length) - HEADER_SIZE),
        };

        ctx.offset += usize::from(length);
        ctx.deposit(RESULT_KEY, LayerOutput::Udp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for UdpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for UdpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "UDP",
            protocol_id: 17,
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
