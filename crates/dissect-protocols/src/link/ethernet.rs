//! Ethernet II dissector with single 802.1Q VLAN tag support.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;
use serde::{Deserialize, Serialize};

/// Metadata key for the deposited [`EthernetResult`].
pub const RESULT_KEY: &str = "ethernet_result";

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

const HEADER_SIZE: usize = 14;
const VLAN_TAG_SIZE: usize = 4;

/// 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    /// Group bit of the first octet.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// 802.1Q tag: TCI plus the encapsulated ethertype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTag {
    pub tci: u16,
    pub ether_type: u16,
}

impl VlanTag {
    /// Priority code point.
    pub fn pcp(&self) -> u8 {
        (self.tci >> 13) as u8
    }

    /// Drop eligible indicator.
    pub fn dei(&self) -> bool {
        self.tci & 0x1000 != 0
    }

    /// VLAN identifier.
    pub fn vid(&self) -> u16 {
        self.tci & 0x0FFF
    }
}

/// Decoded Ethernet frame header.
#[derive(Debug, Clone)]
pub struct EthernetResult<'a> {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    /// The outer ethertype (0x8100 when a VLAN tag is present).
    pub ether_type: u16,
    pub vlan: Option<VlanTag>,
    /// Protocol id of the encapsulated payload (inner ethertype for VLAN).
    pub next_protocol: u16,
    pub payload: ByteSlice<'a>,
}

impl EthernetResult<'_> {
    pub fn is_broadcast(&self) -> bool {
        self.dst_mac.is_broadcast()
    }

    pub fn is_multicast(&self) -> bool {
        self.dst_mac.is_multicast()
    }
}

/// Ethernet II dissector.
///
/// In strict mode, ethertypes in the reserved 802.3 length range (<= 1500)
/// are rejected as `InvalidFormat`; otherwise they pass through so callers
/// can hand the frame to an LLC-aware collaborator.
pub struct EthernetDissector {
    machine: StateMachine,
    error: String,
    strict: bool,
    header: Option<(MacAddr, MacAddr, u16)>,
}

impl EthernetDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
            strict: false,
            header: None,
        }
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    fn parse_header(&mut self, ctx: &mut ParseContext<'_>) -> ParseOutcome {
        let buf = &ctx.buffer;
        if buf.len() < HEADER_SIZE {
            self.error = "Ethernet frame shorter than 14 bytes".into();
            self.machine.fail();
            return ParseOutcome::BufferTooSmall;
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf.as_bytes()[0..6]);
        src.copy_from_slice(&buf.as_bytes()[6..12]);
        let ether_type = buf.read_be16(12);

        if self.strict && ether_type <= 1500 {
            self.error = format!("802.3 length field {ether_type} rejected in strict mode");
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        self.header = Some((MacAddr(dst), MacAddr(src), ether_type));
        ctx.offset += HEADER_SIZE;
        self.machine.advance(ParsePhase::Parsing);
        ParseOutcome::Success
    }

    fn parse_vlan_and_payload<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let (dst_mac, src_mac, ether_type) = self.header.expect("header parsed first");

        let mut vlan = None;
        let mut next_protocol = ether_type;
        if ether_type == ETHERTYPE_VLAN {
            if !ctx.buffer.can_read(VLAN_TAG_SIZE, ctx.offset) {
                return ParseOutcome::NeedMoreData;
            }
            let tag = VlanTag {
                tci: ctx.buffer.read_be16(ctx.offset),
                ether_type: ctx.buffer.read_be16(ctx.offset + 2),
            };
            next_protocol = tag.ether_type;
            vlan = Some(tag);
            ctx.offset += VLAN_TAG_SIZE;
        }

        let payload = ctx.remaining();
        ctx.deposit(
            RESULT_KEY,
            LayerOutput::Ethernet(EthernetResult {
                dst_mac,
                src_mac,
                ether_type,
                vlan,
                next_protocol,
                payload,
            }),
        );
        self.machine.advance(ParsePhase::Complete);
        ParseOutcome::Success
    }
}

impl Default for EthernetDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for EthernetDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "Ethernet",
            protocol_id: 0x0001,
            header_size: HEADER_SIZE,
            min_packet_size: HEADER_SIZE,
            max_packet_size: 1518,
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
                ParsePhase::Initial => self.parse_header(ctx),
                ParsePhase::Parsing => self.parse_vlan_and_payload(ctx),
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
        self.header = None;
    }

    fn progress(&self) -> f64 {
        self.machine.progress()
    }

    fn error_message(&self) -> &str {
        &self.error
    }
}
