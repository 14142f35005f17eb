//! SIP dissector: request/status line plus the core routing headers.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`SipResult`].
pub const RESULT_KEY: &str = "sip_result";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Info,
    Subscribe,
    Notify,
    Message,
    Refer,
    Update,
    Unknown,
}

impl SipMethod {
    fn from_token(token: &str) -> Self {
        match token {
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "REGISTER" => Self::Register,
            "OPTIONS" => Self::Options,
            "INFO" => Self::Info,
            "SUBSCRIBE" => Self::Subscribe,
            "NOTIFY" => Self::Notify,
            "MESSAGE" => Self::Message,
            "REFER" => Self::Refer,
            "UPDATE" => Self::Update,
            _ => Self::Unknown,
        }
    }
}

/// Decoded SIP message.
#[derive(Debug, Clone, Default)]
pub struct SipResult {
    pub is_request: bool,
    pub method: Option<SipMethod>,
    pub request_uri: Option<String>,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    pub via: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub call_id: Option<String>,
    pub cseq: Option<String>,
    pub contact: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
    /// True when the body advertises SDP.
    pub has_sdp_body: bool,
    pub body: Vec<u8>,
}

const SIP_METHOD_TOKENS: &[&str] = &[
    "INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "INFO", "SUBSCRIBE", "NOTIFY",
    "MESSAGE", "REFER", "UPDATE",
];

/// True when the buffer opens with a SIP request or status line.
pub fn looks_like_sip(buffer: &ByteSlice<'_>) -> bool {
    let head = buffer.prefix(12);
    let head = head.as_bytes();
    if head.starts_with(b"SIP/2.0 ") {
        return true;
    }
    SIP_METHOD_TOKENS
        .iter()
        .any(|m| head.len() > m.len() && head.starts_with(m.as_bytes()) && head[m.len()] == b' ')
}

/// SIP dissector.
pub struct SipDissector {
    machine: StateMachine,
    error: String,
}

impl SipDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if !looks_like_sip(&buf) {
            self.error = "not a SIP message".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        let Ok(text) = std::str::from_utf8(buf.as_bytes()) else {
            self.error = "SIP message is not UTF-8".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        };
        let Some((head, body)) = split_head(text) else {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        };

        self.machine.advance(ParsePhase::Parsing);

        let mut lines = head.split("\r\n");
        let Some(start_line) = lines.next() else {
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        };

        let mut result = SipResult::default();
        if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
            result.is_request = false;
            let mut parts = rest.splitn(2, ' ');
            result.status_code = parts.next().and_then(|c| c.parse().ok());
            result.reason = parts.next().map(str::to_owned);
        } else {
            let mut parts = start_line.split(' ');
            let method = parts.next().unwrap_or("");
            result.is_request = true;
            result.method = Some(SipMethod::from_token(method));
            result.request_uri = parts.next().map(str::to_owned);
        }

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "via" | "v" => result.via.push(value.to_owned()),
                "from" | "f" => result.from = Some(value.to_owned()),
                "to" | "t" => result.to = Some(value.to_owned()),
                "call-id" | "i" => result.call_id = Some(value.to_owned()),
                "cseq" => result.cseq = Some(value.to_owned()),
                "contact" | "m" => result.contact = Some(value.to_owned()),
                "content-type" | "c" => result.content_type = Some(value.to_owned()),
                "content-length" | "l" => result.content_length = value.parse().ok(),
                _ => {}
            }
        }

        result.has_sdp_body = result
            .content_type
            .as_deref()
            .map(|ct| ct.eq_ignore_ascii_case("application/sdp"))
            .unwrap_or(false);
        let body_len = result.content_length.unwrap_or(body.len()).min(body.len());
        result.body = body.as_bytes()[..body_len].to_vec();

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Sip(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    text.split_once("\r\n\r\n")
}

impl Default for SipDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for SipDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "SIP",
            protocol_id: 5060,
            header_size: 12,
            min_packet_size: 12,
            max_packet_size: 65535,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        looks_like_sip(buffer)
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
