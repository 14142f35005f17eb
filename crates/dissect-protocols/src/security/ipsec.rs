//! IPsec shells: ESP and AH header extraction, IKE header plus payload-chain
//! walking, algorithm strength tagging and per-SPI replay windows.
//!
//! Payloads stay opaque ciphertext; nothing here verifies or decrypts.

use dissect_common::ParseOutcome;
use dissect_core::ByteSlice;
use std::collections::HashMap;

pub const IP_PROTO_ESP: u8 = 50;
pub const IP_PROTO_AH: u8 = 51;
pub const IKE_PORT: u16 = 500;
pub const IKE_NATT_PORT: u16 = 4500;

const ESP_HEADER_SIZE: usize = 8;
const AH_FIXED_SIZE: usize = 12;
const IKE_HEADER_SIZE: usize = 28;
const REPLAY_WINDOW: u32 = 64;

/// Which IPsec shell a packet carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecProtocol {
    Esp,
    Ah,
    Ike,
}

/// ESP: SPI and sequence; everything after is ciphertext.
#[derive(Debug, Clone, Default)]
pub struct EspHeader {
    pub spi: u32,
    pub sequence: u32,
    pub payload_length: usize,
}

/// AH: integrity data around an unencrypted payload.
#[derive(Debug, Clone, Default)]
pub struct AhHeader {
    pub next_header: u8,
    /// Length field in 32-bit words minus 2.
    pub payload_length: u8,
    pub spi: u32,
    pub sequence: u32,
    pub icv: Vec<u8>,
}

/// One entry of the IKE generic payload chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkePayloadHeader {
    pub payload_type: u8,
    pub critical: bool,
    pub length: u16,
}

impl IkePayloadHeader {
    pub fn type_name(&self) -> &'static str {
        match self.payload_type {
            33 => "Security Association",
            34 => "Key Exchange",
            35 => "Identification (Initiator)",
            36 => "Identification (Responder)",
            37 => "Certificate",
            38 => "Certificate Request",
            39 => "Authentication",
            40 => "Nonce",
            41 => "Notify",
            42 => "Delete",
            43 => "Vendor ID",
            44 => "Traffic Selector (Initiator)",
            45 => "Traffic Selector (Responder)",
            46 => "Encrypted and Authenticated",
            _ => "Unknown",
        }
    }
}

/// IKE header plus walked payload chain.
#[derive(Debug, Clone, Default)]
pub struct IkeInfo {
    pub initiator_spi: u64,
    pub responder_spi: u64,
    pub next_payload: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub exchange_type: u8,
    pub flags: u8,
    pub message_id: u32,
    pub length: u32,
    pub payloads: Vec<IkePayloadHeader>,
}

impl IkeInfo {
    pub fn exchange_name(&self) -> &'static str {
        match (self.major_version, self.exchange_type) {
            (1, 2) => "Identity Protection (Main Mode)",
            (1, 4) => "Aggressive Mode",
            (1, 5) => "Informational",
            (2, 34) => "IKE_SA_INIT",
            (2, 35) => "IKE_AUTH",
            (2, 36) => "CREATE_CHILD_SA",
            (2, 37) => "INFORMATIONAL",
            _ => "Unknown",
        }
    }
}

/// Strength classification for negotiated algorithm names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmStrength {
    Weak,
    Acceptable,
    Strong,
}

/// Tag an algorithm name as known-weak, known-strong or in between.
pub fn rate_algorithm(name: &str) -> AlgorithmStrength {
    let upper = name.to_ascii_uppercase();
    if upper.contains("DES") || upper.contains("MD5") || upper.contains("SHA1") {
        return AlgorithmStrength::Weak;
    }
    if upper.contains("AES-GCM")
        || upper.contains("AES_GCM")
        || upper.contains("SHA-256")
        || upper.contains("SHA256")
        || upper.contains("SHA-384")
        || upper.contains("SHA384")
        || upper.contains("SHA-512")
        || upper.contains("SHA512")
        || upper.contains("CHACHA20")
    {
        return AlgorithmStrength::Strong;
    }
    AlgorithmStrength::Acceptable
}

/// Security findings for one IPsec packet.
#[derive(Debug, Clone, Default)]
pub struct IpsecSecurityAnalysis {
    pub anti_replay_suspect: bool,
    pub weak_algorithms: Vec<String>,
    pub strong_algorithms: Vec<String>,
    pub warnings: Vec<String>,
    /// 0-100.
    pub security_score: u32,
}

/// Decoded IPsec packet.
#[derive(Debug, Clone)]
pub struct IpsecInfo {
    pub protocol: IpsecProtocol,
    pub esp: Option<EspHeader>,
    pub ah: Option<AhHeader>,
    pub ike: Option<IkeInfo>,
    pub encrypted_payload: bool,
    pub security: IpsecSecurityAnalysis,
}

/// IPsec analyzer with per-SPI replay tracking.
pub struct IpsecAnalyzer {
    replay_windows: HashMap<u32, u32>,
}

impl IpsecAnalyzer {
    pub fn new() -> Self {
        Self {
            replay_windows: HashMap::new(),
        }
    }

    /// Parse ESP (IP proto 50) or AH (IP proto 51) payload.
    pub fn parse_ip_payload(
        &mut self,
        buffer: &ByteSlice<'_>,
        ip_protocol: u8,
    ) -> Result<IpsecInfo, ParseOutcome> {
        match ip_protocol {
            IP_PROTO_ESP => self.parse_esp(buffer),
            IP_PROTO_AH => self.parse_ah(buffer),
            _ => Err(ParseOutcome::UnsupportedVersion),
        }
    }

    fn parse_esp(&mut self, buffer: &ByteSlice<'_>) -> Result<IpsecInfo, ParseOutcome> {
        if buffer.len() < ESP_HEADER_SIZE {
            return Err(ParseOutcome::BufferTooSmall);
        }
        let esp = EspHeader {
            spi: buffer.read_be32(0),
            sequence: buffer.read_be32(4),
            payload_length: buffer.len() - ESP_HEADER_SIZE,
        };
        let replay = self.check_replay(esp.spi, esp.sequence);

        let mut info = IpsecInfo {
            protocol: IpsecProtocol::Esp,
            esp: Some(esp),
            ah: None,
            ike: None,
            encrypted_payload: true,
            security: IpsecSecurityAnalysis::default(),
        };
        info.security.anti_replay_suspect = replay;
        if replay {
            info.security
                .warnings
                .push("sequence number far behind the replay window".to_owned());
        }
        info.security.security_score = score(&info.security, true);
        Ok(info)
    }

    fn parse_ah(&mut self, buffer: &ByteSlice<'_>) -> Result<IpsecInfo, ParseOutcome> {
        if buffer.len() < AH_FIXED_SIZE {
            return Err(ParseOutcome::BufferTooSmall);
        }
        let payload_length = buffer.read_u8(1);
        // Total AH length is (payload_length + 2) 32-bit words.
        let total = (usize::from(payload_length) + 2) * 4;
        let icv_len = total.saturating_sub(AH_FIXED_SIZE).min(buffer.len() - AH_FIXED_SIZE);
        let ah = AhHeader {
            next_header: buffer.read_u8(0),
            payload_length,
            spi: buffer.read_be32(4),
            sequence: buffer.read_be32(8),
            icv: buffer.as_bytes()[AH_FIXED_SIZE..AH_FIXED_SIZE + icv_len].to_vec(),
        };
        let replay = self.check_replay(ah.spi, ah.sequence);

        let mut info = IpsecInfo {
            protocol: IpsecProtocol::Ah,
            esp: None,
            ah: Some(ah),
            ike: None,
            encrypted_payload: false,
            security: IpsecSecurityAnalysis::default(),
        };
        info.security.anti_replay_suspect = replay;
        info.security
            .warnings
            .push("AH authenticates but does not encrypt".to_owned());
        info.security.security_score = score(&info.security, false);
        Ok(info)
    }

    /// Parse an IKE message (UDP 500/4500). Payload contents stay opaque.
    pub fn parse_ike(&mut self, buffer: &ByteSlice<'_>) -> Result<IpsecInfo, ParseOutcome> {
        if buffer.len() < IKE_HEADER_SIZE {
            return Err(ParseOutcome::BufferTooSmall);
        }
        let version = buffer.read_u8(17);
        let mut ike = IkeInfo {
            initiator_spi: buffer.read_be64(0),
            responder_spi: buffer.read_be64(8),
            next_payload: buffer.read_u8(16),
            major_version: version >> 4,
            minor_version: version & 0x0F,
            exchange_type: buffer.read_u8(18),
            flags: buffer.read_u8(19),
            message_id: buffer.read_be32(20),
            length: buffer.read_be32(24),
            payloads: Vec::new(),
        };
        if ike.major_version != 1 && ike.major_version != 2 {
            return Err(ParseOutcome::UnsupportedVersion);
        }

        // Generic payload chain: each payload leads with the type of the next.
        let mut next = ike.next_payload;
        let mut offset = IKE_HEADER_SIZE;
        let mut encrypted = false;
        while next != 0 && buffer.can_read(4, offset) {
            let header = IkePayloadHeader {
                payload_type: next,
                critical: buffer.read_u8(offset + 1) & 0x80 != 0,
                length: buffer.read_be16(offset + 2),
            };
            if header.payload_type == 46 {
                encrypted = true;
            }
            if header.length < 4 {
                break;
            }
            ike.payloads.push(header);
            next = buffer.read_u8(offset);
            offset += usize::from(header.length);
        }

        let mut info = IpsecInfo {
            protocol: IpsecProtocol::Ike,
            esp: None,
            ah: None,
            ike: Some(ike),
            encrypted_payload: encrypted,
            security: IpsecSecurityAnalysis::default(),
        };
        if info.ike.as_ref().map(|i| i.major_version) == Some(1) {
            info.security
                .warnings
                .push("IKEv1 negotiation observed".to_owned());
        }
        info.security.security_score = score(&info.security, encrypted);
        Ok(info)
    }

    /// Record negotiated algorithm names into the analysis of `info`.
    pub fn tag_algorithms(info: &mut IpsecInfo, names: &[&str]) {
        for name in names {
            match rate_algorithm(name) {
                AlgorithmStrength::Weak => info.security.weak_algorithms.push((*name).to_owned()),
                AlgorithmStrength::Strong => {
                    info.security.strong_algorithms.push((*name).to_owned())
                }
                AlgorithmStrength::Acceptable => {}
            }
        }
        info.security.security_score = score(&info.security, info.encrypted_payload);
    }

    /// True when `sequence` is so far behind the highest seen for this SPI
    /// that a receiver's anti-replay window would discard it.
    fn check_replay(&mut self, spi: u32, sequence: u32) -> bool {
        let highest = self.replay_windows.entry(spi).or_insert(0);
        if sequence > *highest {
            *highest = sequence;
            return false;
        }
        *highest - sequence > REPLAY_WINDOW
    }
}

impl Default for IpsecAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn score(analysis: &IpsecSecurityAnalysis, encrypted: bool) -> u32 {
    let mut score: u32 = if encrypted { 80 } else { 50 };
    score = score.saturating_sub(analysis.weak_algorithms.len() as u32 * 15);
    if !analysis.strong_algorithms.is_empty() && analysis.weak_algorithms.is_empty() {
        score = (score + 20).min(100);
    }
    if analysis.anti_replay_suspect {
        score = score.saturating_sub(25);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esp_header() {
        let mut p = Vec::new();
        p.extend_from_slice(&0x12345678u32.to_be_bytes());
        p.extend_from_slice(&7u32.to_be_bytes());
        p.extend_from_slice(&[0xEE; 24]);

        let mut analyzer = IpsecAnalyzer::new();
        let info = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&p), IP_PROTO_ESP)
            .unwrap();
        let esp = info.esp.as_ref().unwrap();
        assert_eq!(esp.spi, 0x12345678);
        assert_eq!(esp.sequence, 7);
        assert_eq!(esp.payload_length, 24);
        assert!(info.encrypted_payload);
    }

    #[test]
    fn test_ah_header() {
        let mut p = Vec::new();
        p.push(6); // next header: TCP
        p.push(4); // payload length: (4+2)*4 = 24 bytes total
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&0xAABBCCDDu32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&[0x11; 12]); // ICV
        p.extend_from_slice(&[0x22; 8]); // inner payload

        let mut analyzer = IpsecAnalyzer::new();
        let info = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&p), IP_PROTO_AH)
            .unwrap();
        let ah = info.ah.as_ref().unwrap();
        assert_eq!(ah.next_header, 6);
        assert_eq!(ah.spi, 0xAABBCCDD);
        assert_eq!(ah.icv.len(), 12);
        assert!(!info.encrypted_payload);
    }

    #[test]
    fn test_replay_window() {
        let mut analyzer = IpsecAnalyzer::new();
        let packet = |seq: u32| {
            let mut p = Vec::new();
            p.extend_from_slice(&9u32.to_be_bytes());
            p.extend_from_slice(&seq.to_be_bytes());
            p
        };

        let fresh = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&packet(1000)), IP_PROTO_ESP)
            .unwrap();
        assert!(!fresh.security.anti_replay_suspect);

        // Slightly old: still inside the window.
        let recent = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&packet(990)), IP_PROTO_ESP)
            .unwrap();
        assert!(!recent.security.anti_replay_suspect);

        // Far behind: flagged.
        let stale = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&packet(100)), IP_PROTO_ESP)
            .unwrap();
        assert!(stale.security.anti_replay_suspect);
    }

    #[test]
    fn test_ike_header_and_chain() {
        let mut p = Vec::new();
        p.extend_from_slice(&0x1111_2222_3333_4444u64.to_be_bytes());
        p.extend_from_slice(&0u64.to_be_bytes());
        p.push(33); // first payload: SA
        p.push(0x20); // IKEv2
        p.push(34); // IKE_SA_INIT
        p.push(0x08);
        p.extend_from_slice(&0u32.to_be_bytes()); // message id
        p.extend_from_slice(&60u32.to_be_bytes()); // length
        // SA payload: next=40 (Nonce), flags, length 8, body 4
        p.extend_from_slice(&[40, 0, 0, 8]);
        p.extend_from_slice(&[0xAA; 4]);
        // Nonce payload: next=0, length 8
        p.extend_from_slice(&[0, 0, 0, 8]);
        p.extend_from_slice(&[0xBB; 4]);

        let mut analyzer = IpsecAnalyzer::new();
        let info = analyzer.parse_ike(&ByteSlice::borrowed(&p)).unwrap();
        let ike = info.ike.as_ref().unwrap();
        assert_eq!(ike.initiator_spi, 0x1111_2222_3333_4444);
        assert_eq!(ike.major_version, 2);
        assert_eq!(ike.exchange_name(), "IKE_SA_INIT");
        assert_eq!(ike.payloads.len(), 2);
        assert_eq!(ike.payloads[0].payload_type, 33);
        assert_eq!(ike.payloads[0].type_name(), "Security Association");
        assert_eq!(ike.payloads[1].payload_type, 40);
    }

    #[test]
    fn test_algorithm_rating() {
        assert_eq!(rate_algorithm("3DES-CBC"), AlgorithmStrength::Weak);
        assert_eq!(rate_algorithm("HMAC-MD5"), AlgorithmStrength::Weak);
        assert_eq!(rate_algorithm("HMAC-SHA1"), AlgorithmStrength::Weak);
        assert_eq!(rate_algorithm("AES-GCM-256"), AlgorithmStrength::Strong);
        assert_eq!(rate_algorithm("HMAC-SHA256"), AlgorithmStrength::Strong);
        assert_eq!(rate_algorithm("AES-CBC-128"), AlgorithmStrength::Acceptable);
    }

    #[test]
    fn test_algorithm_tagging_affects_score() {
        let mut p = Vec::new();
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes());
        let mut analyzer = IpsecAnalyzer::new();
        let mut info = analyzer
            .parse_ip_payload(&ByteSlice::borrowed(&p), IP_PROTO_ESP)
            .unwrap();
        let base = info.security.security_score;
        IpsecAnalyzer::tag_algorithms(&mut info, &["DES-CBC", "HMAC-MD5"]);
        assert!(info.security.security_score < base);
        assert_eq!(info.security.weak_algorithms.len(), 2);
    }
}
