//! The dissector contract and the phase machine every dissector drives.

use super::context::ParseContext;
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Static descriptor of a wire protocol, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub name: &'static str,
    /// EtherType, IP protocol number or well-known port, depending on layer.
    pub protocol_id: u16,
    /// Fixed-header lower bound in bytes.
    pub header_size: usize,
    pub min_packet_size: usize,
    pub max_packet_size: usize,
}

/// Uniform contract implemented by every dissector.
///
/// `parse` runs the dissector's state machine until a terminal phase or a
/// non-success outcome; on success the result record sits in the context
/// metadata under the dissector's `"<proto>_result"` key.
pub trait Dissector: Send {
    fn protocol_info(&self) -> &ProtocolInfo;

    /// Cheap probe: could this buffer plausibly start with this protocol?
    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool;

    fn parse<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome;

    /// Return to `Initial` so the instance can parse another packet.
    fn reset(&mut self);

    /// 0.0 before parsing, 0.5 mid-parse, 1.0 when complete.
    fn progress(&self) -> f64 {
        0.0
    }

    /// Human-readable description of the last failure, empty otherwise.
    fn error_message(&self) -> &str {
        ""
    }
}

/// Phase tracker with guarded transitions.
///
/// The happy path is `Initial -> Parsing -> Complete`; `Error` is reachable
/// from anywhere. Dissectors loop over `phase()` inside `parse`, invoking
/// their per-phase step until a terminal phase is reached, which gives every
/// layer the same driver shape.
#[derive(Debug, Default)]
pub struct StateMachine {
    phase: ParsePhase,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    /// Move to `next`. Transitions out of a terminal phase are ignored;
    /// use [`reset`](Self::reset) to start over.
    pub fn advance(&mut self, next: ParsePhase) {
        if self.phase.is_terminal() {
            return;
        }
        debug_assert!(
            matches!(
                (self.phase, next),
                (ParsePhase::Initial, ParsePhase::Parsing)
                    | (ParsePhase::Initial, ParsePhase::Complete)
                    | (ParsePhase::Parsing, ParsePhase::Complete)
                    | (_, ParsePhase::Error)
            ),
            "invalid phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Transition to the error phase, valid from anywhere.
    pub fn fail(&mut self) {
        self.phase = ParsePhase::Error;
    }

    pub fn reset(&mut self) {
        self.phase = ParsePhase::Initial;
    }

    /// Progress value shared by all dissectors.
    pub fn progress(&self) -> f64 {
        match self.phase {
            ParsePhase::Initial => 0.0,
            ParsePhase::Parsing => 0.5,
            ParsePhase::Complete => 1.0,
            ParsePhase::Error => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut m = StateMachine::new();
        assert_eq!(m.phase(), ParsePhase::Initial);
        m.advance(ParsePhase::Parsing);
        assert_eq!(m.phase(), ParsePhase::Parsing);
        m.advance(ParsePhase::Complete);
        assert_eq!(m.phase(), ParsePhase::Complete);
        assert_eq!(m.progress(), 1.0);
    }

    #[test]
    fn test_error_from_anywhere() {
        let mut m = StateMachine::new();
        m.fail();
        assert_eq!(m.phase(), ParsePhase::Error);
        m.reset();
        m.advance(ParsePhase::Parsing);
        m.fail();
        assert_eq!(m.phase(), ParsePhase::Error);
    }

    #[test]
    fn test_terminal_is_sticky() {
        let mut m = StateMachine::new();
        m.advance(ParsePhase::Parsing);
        m.advance(ParsePhase::Complete);
        m.advance(ParsePhase::Error);
        assert_eq!(m.phase(), ParsePhase::Complete);
    }
}
