//! SNMP dissector: BER decoding of v1/v2c community messages and the v3
//! global header with scoped PDU.
//!
//! MIB resolution stops at OID decoding; name lookup belongs to an external
//! collaborator.

use crate::framework::{Dissector, LayerOutput, ParseContext, ProtocolInfo, StateMachine};
use dissect_common::{ParseOutcome, ParsePhase};
use dissect_core::ByteSlice;

/// Metadata key for the deposited [`SnmpMessage`].
pub const RESULT_KEY: &str = "snmp_result";

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;

/// Object identifier in decoded (dotted) form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Oid(pub Vec<u32>);

impl Oid {
    /// Decode the packed base-128 form. The first byte carries the first two
    /// arcs as `40 * X + Y`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let mut components = vec![u32::from(data[0]) / 40, u32::from(data[0]) % 40];
        let mut value: u32 = 0;
        for &byte in &data[1..] {
            value = value.checked_mul(128)?.checked_add(u32::from(byte & 0x7F))?;
            if byte & 0x80 == 0 {
                components.push(value);
                value = 0;
            }
        }
        Some(Self(components))
    }

    pub fn is_prefix_of(&self, other: &Oid) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// A decoded BER value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    Oid(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    Unknown { tag: u8, data: Vec<u8> },
}

/// One variable binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: SnmpValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpPduType {
    GetRequest,
    GetNextRequest,
    GetResponse,
    SetRequest,
    Trap,
    GetBulkRequest,
    InformRequest,
    TrapV2,
    Report,
}

impl SnmpPduType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0xA0 => Some(Self::GetRequest),
            0xA1 => Some(Self::GetNextRequest),
            0xA2 => Some(Self::GetResponse),
            0xA3 => Some(Self::SetRequest),
            0xA4 => Some(Self::Trap),
            0xA5 => Some(Self::GetBulkRequest),
            0xA6 => Some(Self::InformRequest),
            0xA7 => Some(Self::TrapV2),
            0xA8 => Some(Self::Report),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::GetRequest
                | Self::GetNextRequest
                | Self::SetRequest
                | Self::GetBulkRequest
                | Self::InformRequest
        )
    }
}

/// SNMPv3 message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnmpV3Flags {
    pub authentication: bool,
    pub privacy: bool,
    pub reportable: bool,
}

/// SNMPv3 global header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpV3Header {
    pub message_id: i64,
    pub max_size: i64,
    pub flags: SnmpV3Flags,
    pub security_model: i64,
    pub context_engine_id: Vec<u8>,
    pub context_name: Vec<u8>,
}

/// Decoded PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpPdu {
    pub pdu_type: SnmpPduType,
    pub request_id: i64,
    pub error_status: i64,
    pub error_index: i64,
    pub bindings: Vec<VarBind>,
}

/// Decoded SNMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpMessage {
    pub version: SnmpVersion,
    /// v1/v2c community string.
    pub community: Option<String>,
    pub v3_header: Option<SnmpV3Header>,
    /// True for a v3 message whose scoped PDU is encrypted.
    pub encrypted: bool,
    /// Absent only for encrypted v3 messages.
    pub pdu: Option<SnmpPdu>,
}

impl SnmpMessage {
    pub fn is_authenticated(&self) -> bool {
        self.v3_header
            .as_ref()
            .map(|h| h.flags.authentication)
            .unwrap_or(false)
    }
}

struct BerReader<'d> {
    data: &'d [u8],
    offset: usize,
}

impl<'d> BerReader<'d> {
    fn new(data: &'d [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Read one TLV, returning `(tag, content)`.
    fn read_tlv(&mut self) -> Option<(u8, &'d [u8])> {
        let tag = *self.data.get(self.offset)?;
        self.offset += 1;
        let length = self.read_length()?;
        let content = self.data.get(self.offset..self.offset + length)?;
        self.offset += length;
        Some((tag, content))
    }

    /// Short or long definite-length form; indefinite lengths are rejected.
    fn read_length(&mut self) -> Option<usize> {
        let first = *self.data.get(self.offset)?;
        self.offset += 1;
        if first & 0x80 == 0 {
            return Some(usize::from(first));
        }
        let octets = usize::from(first & 0x7F);
        if octets == 0 || octets > 4 {
            return None;
        }
        let mut length = 0usize;
        for _ in 0..octets {
            length = (length << 8) | usize::from(*self.data.get(self.offset)?);
            self.offset += 1;
        }
        Some(length)
    }

    fn expect(&mut self, expected_tag: u8) -> Option<&'d [u8]> {
        let (tag, content) = self.read_tlv()?;
        (tag == expected_tag).then_some(content)
    }

    fn read_integer(&mut self) -> Option<i64> {
        let content = self.expect(TAG_INTEGER)?;
        decode_integer(content)
    }

    fn read_octet_string(&mut self) -> Option<&'d [u8]> {
        self.expect(TAG_OCTET_STRING)
    }
}

fn decode_integer(content: &[u8]) -> Option<i64> {
    if content.is_empty() || content.len() > 8 {
        return None;
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | i64::from(byte);
    }
    Some(value)
}

fn decode_unsigned(content: &[u8]) -> Option<u64> {
    if content.len() > 9 {
        return None;
    }
    let mut value: u64 = 0;
    for &byte in content {
        value = value.checked_shl(8)? | u64::from(byte);
    }
    Some(value)
}

fn decode_value(tag: u8, content: &[u8]) -> SnmpValue {
    match tag {
        TAG_INTEGER => decode_integer(content)
            .map(SnmpValue::Integer)
            .unwrap_or(SnmpValue::Unknown {
                tag,
                data: content.to_vec(),
            }),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => Oid::decode(content)
            .map(SnmpValue::Oid)
            .unwrap_or(SnmpValue::Unknown {
                tag,
                data: content.to_vec(),
            }),
        TAG_IP_ADDRESS if content.len() == 4 => {
            SnmpValue::IpAddress([content[0], content[1], content[2], content[3]])
        }
        TAG_COUNTER32 => SnmpValue::Counter32(decode_unsigned(content).unwrap_or(0) as u32),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_unsigned(content).unwrap_or(0) as u32),
        TAG_TIMETICKS => SnmpValue::TimeTicks(decode_unsigned(content).unwrap_or(0) as u32),
        TAG_OPAQUE => SnmpValue::Opaque(content.to_vec()),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content).unwrap_or(0)),
        _ => SnmpValue::Unknown {
            tag,
            data: content.to_vec(),
        },
    }
}

fn parse_pdu(reader: &mut BerReader<'_>) -> Option<SnmpPdu> {
    let (tag, content) = reader.read_tlv()?;
    let pdu_type = SnmpPduType::from_tag(tag)?;
    let mut pdu_reader = BerReader::new(content);

    let request_id = pdu_reader.read_integer()?;
    let error_status = pdu_reader.read_integer()?;
    let error_index = pdu_reader.read_integer()?;

    let bindings_content = pdu_reader.expect(TAG_SEQUENCE)?;
    let mut bindings_reader = BerReader::new(bindings_content);
    let mut bindings = Vec::new();
    while bindings_reader.remaining() > 0 {
        let entry = bindings_reader.expect(TAG_SEQUENCE)?;
        let mut entry_reader = BerReader::new(entry);
        let oid = Oid::decode(entry_reader.expect(TAG_OID)?)?;
        let (value_tag, value_content) = entry_reader.read_tlv()?;
        bindings.push(VarBind {
            oid,
            value: decode_value(value_tag, value_content),
        });
    }

    Some(SnmpPdu {
        pdu_type,
        request_id,
        error_status,
        error_index,
        bindings,
    })
}

fn parse_message(data: &[u8]) -> Result<SnmpMessage, ParseOutcome> {
    let mut outer = BerReader::new(data);
    let message_content = outer.expect(TAG_SEQUENCE).ok_or(ParseOutcome::InvalidFormat)?;
    let mut reader = BerReader::new(message_content);

    let version = match reader.read_integer().ok_or(ParseOutcome::InvalidFormat)? {
        0 => SnmpVersion::V1,
        1 => SnmpVersion::V2c,
        3 => SnmpVersion::V3,
        _ => return Err(ParseOutcome::UnsupportedVersion),
    };

    match version {
        SnmpVersion::V1 | SnmpVersion::V2c => {
            let community = reader
                .read_octet_string()
                .ok_or(ParseOutcome::InvalidFormat)?;
            let pdu = parse_pdu(&mut reader).ok_or(ParseOutcome::InvalidFormat)?;
            Ok(SnmpMessage {
                version,
                community: Some(String::from_utf8_lossy(community).into_owned()),
                v3_header: None,
                encrypted: false,
                pdu: Some(pdu),
            })
        }
        SnmpVersion::V3 => {
            let global = reader.expect(TAG_SEQUENCE).ok_or(ParseOutcome::InvalidFormat)?;
            let mut global_reader = BerReader::new(global);
            let message_id = global_reader.read_integer().ok_or(ParseOutcome::InvalidFormat)?;
            let max_size = global_reader.read_integer().ok_or(ParseOutcome::InvalidFormat)?;
            let flag_bits = global_reader
                .read_octet_string()
                .and_then(|f| f.first().copied())
                .ok_or(ParseOutcome::InvalidFormat)?;
            let security_model = global_reader
                .read_integer()
                .ok_or(ParseOutcome::InvalidFormat)?;

            let flags = SnmpV3Flags {
                authentication: flag_bits & 0x01 != 0,
                privacy: flag_bits & 0x02 != 0,
                reportable: flag_bits & 0x04 != 0,
            };

            // Opaque security parameters (USM blob).
            reader
                .read_octet_string()
                .ok_or(ParseOutcome::InvalidFormat)?;

            if flags.privacy {
                // Scoped PDU is an encrypted OCTET STRING; nothing to decode.
                return Ok(SnmpMessage {
                    version,
                    community: None,
                    v3_header: Some(SnmpV3Header {
                        message_id,
                        max_size,
                        flags,
                        security_model,
                        context_engine_id: Vec::new(),
                        context_name: Vec::new(),
                    }),
                    encrypted: true,
                    pdu: None,
                });
            }

            let scoped = reader.expect(TAG_SEQUENCE).ok_or(ParseOutcome::InvalidFormat)?;
            let mut scoped_reader = BerReader::new(scoped);
            let context_engine_id = scoped_reader
                .read_octet_string()
                .ok_or(ParseOutcome::InvalidFormat)?
                .to_vec();
            let context_name = scoped_reader
                .read_octet_string()
                .ok_or(ParseOutcome::InvalidFormat)?
                .to_vec();
            let pdu = parse_pdu(&mut scoped_reader).ok_or(ParseOutcome::InvalidFormat)?;

            Ok(SnmpMessage {
                version,
                community: None,
                v3_header: Some(SnmpV3Header {
                    message_id,
                    max_size,
                    flags,
                    security_model,
                    context_engine_id,
                    context_name,
                }),
                encrypted: false,
                pdu: Some(pdu),
            })
        }
    }
}

/// SNMP dissector.
pub struct SnmpDissector {
    machine: StateMachine,
    error: String,
}

impl SnmpDissector {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            error: String::new(),
        }
    }

    fn parse_packet<'a>(&mut self, ctx: &mut ParseContext<'a>) -> ParseOutcome {
        let buf = ctx.remaining();
        if buf.len() < 10 {
            self.machine.fail();
            return ParseOutcome::NeedMoreData;
        }
        if buf.read_u8(0) != TAG_SEQUENCE {
            self.error = "missing BER SEQUENCE tag".into();
            self.machine.fail();
            return ParseOutcome::InvalidFormat;
        }

        self.machine.advance(ParsePhase::Parsing);

        match parse_message(buf.as_bytes()) {
            Ok(message) => {
                ctx.offset += buf.len();
                ctx.deposit(RESULT_KEY, LayerOutput::Snmp(message));
                self.machine.advance(ParsePhase::Complete);
                ParseOutcome::Success
            }
            Err(outcome) => {
                self.error = "malformed SNMP message".into();
                self.machine.fail();
                outcome
            }
        }
    }
}

impl Default for SnmpDissector {
    fn default() -> Self {
        Self::new()
    }
}

impl Dissector for SnmpDissector {
    fn protocol_info(&self) -> &ProtocolInfo {
        static INFO: ProtocolInfo = ProtocolInfo {
            name: "SNMP",
            protocol_id: 161,
            header_size: 4,
            min_packet_size: 10,
            max_packet_size: 65507,
        };
        &INFO
    }

    fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        buffer.len() >= 10 && buffer.read_u8(0) == TAG_SEQUENCE
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

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        assert!(content.len() < 128);
        out.push(content.len() as u8);
        out.extend_from_slice(content);
        out
    }

    fn int(value: u8) -> Vec<u8> {
        tlv(TAG_INTEGER, &[value])
    }

    fn v2c_get(community: &str, oid_bytes: &[u8]) -> Vec<u8> {
        let binding = {
            let mut b = tlv(TAG_OID, oid_bytes);
            b.extend_from_slice(&tlv(TAG_NULL, &[]));
            tlv(TAG_SEQUENCE, &b)
        };
        let bindings = tlv(TAG_SEQUENCE, &binding);
        let mut pdu_content = int(42); // request id
        pdu_content.extend_from_slice(&int(0)); // error status
        pdu_content.extend_from_slice(&int(0)); // error index
        pdu_content.extend_from_slice(&bindings);
        let pdu = tlv(0xA0, &pdu_content);

        let mut msg = int(1); // version: v2c
        msg.extend_from_slice(&tlv(TAG_OCTET_STRING, community.as_bytes()));
        msg.extend_from_slice(&pdu);
        tlv(TAG_SEQUENCE, &msg)
    }

    #[test]
    fn test_oid_decode() {
        // 1.3.6.1.2.1 == 0x2B 0x06 0x01 0x02 0x01
        let oid = Oid::decode(&[0x2B, 0x06, 0x01, 0x02, 0x01]).unwrap();
        assert_eq!(oid.to_string(), "1.3.6.1.2.1");

        // Multi-byte arc: 1.3.6.1.4.1.311 (311 = 0x82 0x37)
        let oid = Oid::decode(&[0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37]).unwrap();
        assert_eq!(oid.to_string(), "1.3.6.1.4.1.311");
    }

    #[test]
    fn test_v2c_get_request() {
        let data = v2c_get("public", &[0x2B, 0x06, 0x01, 0x02, 0x01]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = SnmpDissector::new();

        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let m = ctx.get(RESULT_KEY).unwrap().as_snmp().unwrap();
        assert_eq!(m.version, SnmpVersion::V2c);
        assert_eq!(m.community.as_deref(), Some("public"));
        let pdu = m.pdu.as_ref().unwrap();
        assert_eq!(pdu.pdu_type, SnmpPduType::GetRequest);
        assert!(pdu.pdu_type.is_request());
        assert_eq!(pdu.request_id, 42);
        assert_eq!(pdu.bindings.len(), 1);
        assert_eq!(pdu.bindings[0].oid.to_string(), "1.3.6.1.2.1");
        assert_eq!(pdu.bindings[0].value, SnmpValue::Null);
    }

    #[test]
    fn test_unsupported_version() {
        let mut msg = int(7);
        msg.extend_from_slice(&tlv(TAG_OCTET_STRING, b"x"));
        let data = tlv(TAG_SEQUENCE, &msg);
        // Pad to minimum probe size.
        let mut padded = data.clone();
        padded.extend_from_slice(&[0; 8]);
        let mut ctx = ParseContext::new(ByteSlice::borrowed(&padded));
        assert_eq!(
            SnmpDissector::new().parse(&mut ctx),
            ParseOutcome::UnsupportedVersion
        );
    }

    #[test]
    fn test_v3_header() {
        let mut global = int(99); // message id
        global.extend_from_slice(&int(100)); // max size
        global.extend_from_slice(&tlv(TAG_OCTET_STRING, &[0x05])); // auth + reportable
        global.extend_from_slice(&int(3)); // USM

        let mut scoped = tlv(TAG_OCTET_STRING, b"engine");
        scoped.extend_from_slice(&tlv(TAG_OCTET_STRING, b""));
        let mut pdu_content = int(7);
        pdu_content.extend_from_slice(&int(0));
        pdu_content.extend_from_slice(&int(0));
        pdu_content.extend_from_slice(&tlv(TAG_SEQUENCE, &[]));
        scoped.extend_from_slice(&tlv(0xA0, &pdu_content));

        let mut msg = int(3); // version 3
        msg.extend_from_slice(&tlv(TAG_SEQUENCE, &global));
        msg.extend_from_slice(&tlv(TAG_OCTET_STRING, b"usm-params"));
        msg.extend_from_slice(&tlv(TAG_SEQUENCE, &scoped));
        let data = tlv(TAG_SEQUENCE, &msg);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = SnmpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let m = ctx.get(RESULT_KEY).unwrap().as_snmp().unwrap();
        assert_eq!(m.version, SnmpVersion::V3);
        let h = m.v3_header.as_ref().unwrap();
        assert_eq!(h.message_id, 99);
        assert!(h.flags.authentication);
        assert!(h.flags.reportable);
        assert!(!h.flags.privacy);
        assert_eq!(h.context_engine_id, b"engine");
        assert!(!m.encrypted);
        assert!(m.pdu.is_some());
    }

    #[test]
    fn test_counter64_value() {
        let binding = {
            let mut b = tlv(TAG_OID, &[0x2B, 0x06]);
            b.extend_from_slice(&tlv(TAG_COUNTER64, &[0x01, 0x00, 0x00, 0x00, 0x00]));
            tlv(TAG_SEQUENCE, &b)
        };
        let bindings = tlv(TAG_SEQUENCE, &binding);
        let mut pdu_content = int(1);
        pdu_content.extend_from_slice(&int(0));
        pdu_content.extend_from_slice(&int(0));
        pdu_content.extend_from_slice(&bindings);
        let pdu = tlv(0xA2, &pdu_content);
        let mut msg = int(1);
        msg.extend_from_slice(&tlv(TAG_OCTET_STRING, b"public"));
        msg.extend_from_slice(&pdu);
        let data = tlv(TAG_SEQUENCE, &msg);

        let mut ctx = ParseContext::new(ByteSlice::borrowed(&data));
        let mut dissector = SnmpDissector::new();
        assert_eq!(dissector.parse(&mut ctx), ParseOutcome::Success);
        let m = ctx.get(RESULT_KEY).unwrap().as_snmp().unwrap();
        let pdu = m.pdu.as_ref().unwrap();
        assert_eq!(pdu.pdu_type, SnmpPduType::GetResponse);
        assert_eq!(pdu.bindings[0].value, SnmpValue::Counter64(1 << 32));
    }
}
