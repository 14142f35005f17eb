//! DHCP dissector: fixed BOOTP header, magic cookie, TLV options.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;
use std::net::Ipv4Addr;

/// Metadata key for the deposited [`DhcpResult`].
pub const RESULT_KEY: &str = "dhcp_result";

const BOOTP_HEADER_SIZE: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_REQUESTED_ADDRESS: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_IDENTIFIER: u8 = 54;
pub const OPT_END: u8 = 255;

/// DHCP message type carried in option 53.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Unknown(u8),
}

impl From<u8> for DhcpMessageType {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => Self::Unknown(other),
        }
    }
}

/// One TLV option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn as_u32(&self) -> Option<u32> {
        (self.data.len() >= 4)
            .then(|| u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]))
    }

    pub fn as_ip(&self) -> Option<Ipv4Addr> {
        self.as_u32().map(Ipv4Addr::from)
    }

    pub fn as_ip_list(&self) -> Vec<Ipv4Addr> {
        self.data
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Decoded DHCP message.
#[derive(Debug, Clone)]
pub struct DhcpResult {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<DhcpOption>,
    /// True when the option list reached the 0xFF terminator.
    pub options_terminated: bool,
}

impl DhcpResult {
    fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// Option 53.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.option(OPT_MESSAGE_TYPE)
            .and_then(|o| o.data.first())
            .map(|&v| DhcpMessageType::from(v))
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.option(OPT_SERVER_IDENTIFIER).and_then(|o| o.as_ip())
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option(OPT_REQUESTED_ADDRESS).and_then(|o| o.as_ip())
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.option(OPT_LEASE_TIME).and_then(|o| o.as_u32())
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.option(OPT_DNS_SERVER)
            .map(|o| o.as_ip_list())
            .unwrap_or_default()
    }

    pub fn hostname(&self) -> Option<String> {
        self.option(OPT_HOST_NAME).map(|o| o.as_string())
    }

    pub fn is_request_direction(&self) -> bool {
        self.op == 1
    }
}

/// DHCP dissector.
pub struct DhcpDissector {
    machine: StateMachine,
    error: String,
}

impl DhcpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < BOOTP_HEADER_SIZE + 4 {
            self.error = "DHCP message shorter than BOOTP header + cookie".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        if &buf.as_bytes()[BOOTP_HEADER_SIZE..BOOTP_HEADER_SIZE + 4] != MAGIC_COOKIE {
            self.error = "DHCP magic cookie mismatch".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        self.machine.advance(ParsePhase::Parsing);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf.as_bytes()[28..44]);

        let mut options = Vec::new();
        let mut options_terminated = false;
        let mut offset = BOOTP_HEADER_SIZE + 4;
        while offset < buf.len() {
            let code = buf.read_u8(offset);
            offset += 1;
            if code == OPT_END {
                options_terminated = true;
                break;
            }
            if code == OPT_PAD {
                continue;
            }
            if offset >= buf.len() {
                break;
            }
            let length = usize::from(buf.read_u8(offset));
            offset += 1;
            if offset + length > buf.len() {
                break;
            }
            options.push(DhcpOption {
                code,
                data: buf.as_bytes()[offset..offset + length].to_vec(),
            });
            offset += length;
        }

        let result = DhcpResult {
            op: buf.read_u8(0),
            htype: buf.read_u8(1),
            hlen: buf.read_u8(2),
            hops: buf.read_u8(3),
            xid: buf.read_be32(4),
            secs: buf.read_be16(8),
            flags: buf.read_be16(10),
            ciaddr: Ipv4Addr::from(buf.read_be32(12)),
            yiaddr: Ipv4Addr::from(buf.read_be32(16)),
            siaddr: Ipv4Addr::from(buf.read_be32(20)),
            giaddr: Ipv4Addr::from(buf.read_be32(24)),
            chaddr,
            options,
            options_terminated,
        };

        ctx.offset += buf.len();
        ctx.deposit(RESULT_KEY, LayerOutput::Dhcp(result));
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for DhcpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for DhcpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "DHCP",
            protocol_id: 67,
            header_size: BOOTP_HEADER_SIZE,
            min_packet_size: BOOTP_HEADER_SIZE + 4,
            max_packet_size: 1500,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= BOOTP_HEADER_SIZE + 4
            && matches!(buffer.read_u8(0), 1 | 2)
            && &buffer.as_bytes()[BOOTP_HEADER_SIZE..BOOTP_HEADER_SIZE + 4] == MAGIC_COOKIE
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
