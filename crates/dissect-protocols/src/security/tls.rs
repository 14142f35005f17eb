//! TLS deep inspector: record and handshake parsing, cipher-suite scoring,
//! handshake-state tracking, vulnerability heuristics and JA3 fingerprints.
//!
//! Analysis is heuristic, not cryptographic proof: nothing here verifies
//! signatures or decrypts payloads.

use dissect_core::ByteSlice;
use md5::{Digest, Md5};
use std::collections::HashMap;

pub const TLS_PORT: u16 = 443;

pub const RECORD_CHANGE_CIPHER_SPEC: u8 = 20;
pub const RECORD_ALERT: u8 = 21;
pub const RECORD_HANDSHAKE: u8 = 22;
pub const RECORD_APPLICATION_DATA: u8 = 23;
pub const RECORD_HEARTBEAT: u8 = 24;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_CERTIFICATE: u8 = 11;
pub const HANDSHAKE_SERVER_KEY_EXCHANGE: u8 = 12;
pub const HANDSHAKE_CERTIFICATE_REQUEST: u8 = 13;
pub const HANDSHAKE_SERVER_HELLO_DONE: u8 = 14;
pub const HANDSHAKE_CERTIFICATE_VERIFY: u8 = 15;
pub const HANDSHAKE_CLIENT_KEY_EXCHANGE: u8 = 16;
pub const HANDSHAKE_FINISHED: u8 = 20;

pub const VERSION_SSL3: u16 = 0x0300;
pub const VERSION_TLS10: u16 = 0x0301;
pub const VERSION_TLS11: u16 = 0x0302;
pub const VERSION_TLS12: u16 = 0x0303;
pub const VERSION_TLS13: u16 = 0x0304;

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_EC_POINT_FORMATS: u16 = 11;
pub const EXT_ALPN: u16 = 16;

const RECORD_HEADER_SIZE: usize = 5;
const HANDSHAKE_HEADER_SIZE: usize = 4;
const MAX_RECORD_SIZE: u16 = 16384 + 2048;

/// One entry from the cipher-suite database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub key_exchange: &'static str,
    pub authentication: &'static str,
    pub encryption: &'static str,
    pub mac: &'static str,
    pub is_aead: bool,
    pub key_bits: u16,
    pub iv_bytes: u16,
    pub mac_bytes: u16,
    pub supports_pfs: bool,
    /// 1 (broken) to 5 (recommended).
    pub security_level: u8,
}

impl CipherSuite {
    pub fn is_weak(&self) -> bool {
        self.encryption.contains("RC4")
            || self.encryption.contains("DES")
            || self.encryption.contains("NULL")
            || self.mac == "MD5"
            || self.security_level < 3
    }
}

macro_rules! suite {
    ($id:expr, $name:expr, $kx:expr, $auth:expr, $enc:expr, $mac:expr,
     $aead:expr, $bits:expr, $iv:expr, $mac_len:expr, $pfs:expr, $level:expr) => {
        (
            $id,
            CipherSuite {
                id: $id,
                name: $name,
                key_exchange: $kx,
                authentication: $auth,
                encryption: $enc,
                mac: $mac,
                is_aead: $aead,
                key_bits: $bits,
                iv_bytes: $iv,
                mac_bytes: $mac_len,
                supports_pfs: $pfs,
                security_level: $level,
            },
        )
    };
}

fn cipher_suite_database() -> HashMap<u16, CipherSuite> {
    [
        suite!(0x0000, "TLS_NULL_WITH_NULL_NULL", "NULL", "NULL", "NULL", "NULL", false, 0, 0, 0, false, 1),
        suite!(0x0004, "TLS_RSA_WITH_RC4_128_MD5", "RSA", "RSA", "RC4-128", "MD5", false, 128, 0, 16, false, 1),
        suite!(0x0005, "TLS_RSA_WITH_RC4_128_SHA", "RSA", "RSA", "RC4-128", "SHA1", false, 128, 0, 20, false, 1),
        suite!(0x000A, "TLS_RSA_WITH_3DES_EDE_CBC_SHA", "RSA", "RSA", "3DES-EDE-CBC", "SHA1", false, 168, 8, 20, false, 2),
        suite!(0x002F, "TLS_RSA_WITH_AES_128_CBC_SHA", "RSA", "RSA", "AES-128-CBC", "SHA1", false, 128, 16, 20, false, 3),
        suite!(0x0035, "TLS_RSA_WITH_AES_256_CBC_SHA", "RSA", "RSA", "AES-256-CBC", "SHA1", false, 256, 16, 20, false, 3),
        suite!(0x009C, "TLS_RSA_WITH_AES_128_GCM_SHA256", "RSA", "RSA", "AES-128-GCM", "SHA256", true, 128, 12, 16, false, 4),
        suite!(0xC02B, "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256", "ECDHE", "ECDSA", "AES-128-GCM", "SHA256", true, 128, 12, 16, true, 5),
        suite!(0xC02C, "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384", "ECDHE", "ECDSA", "AES-256-GCM", "SHA384", true, 256, 12, 16, true, 5),
        suite!(0xC02F, "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256", "ECDHE", "RSA", "AES-128-GCM", "SHA256", true, 128, 12, 16, true, 5),
        suite!(0xC030, "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384", "ECDHE", "RSA", "AES-256-GCM", "SHA384", true, 256, 12, 16, true, 5),
        suite!(0x1301, "TLS_AES_128_GCM_SHA256", "ECDHE", "ECDSA", "AES-128-GCM", "SHA256", true, 128, 12, 16, true, 5),
        suite!(0x1302, "TLS_AES_256_GCM_SHA384", "ECDHE", "ECDSA", "AES-256-GCM", "SHA384", true, 256, 12, 16, true, 5),
        suite!(0x1303, "TLS_CHACHA20_POLY1305_SHA256", "ECDHE", "ECDSA", "CHACHA20-POLY1305", "SHA256", true, 256, 12, 16, true, 5),
    ]
    .into_iter()
    .collect()
}

/// A parsed extension with the well-known ones decoded.
#[derive(Debug, Clone, Default)]
pub struct TlsExtension {
    pub ext_type: u16,
    pub data: Vec<u8>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
}

/// Handshake milestones per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeState {
    pub client_hello_seen: bool,
    pub server_hello_seen: bool,
    pub certificate_seen: bool,
    pub server_key_exchange_seen: bool,
    pub certificate_request_seen: bool,
    pub server_hello_done_seen: bool,
    pub client_key_exchange_seen: bool,
    pub certificate_verify_seen: bool,
    pub client_finished_seen: bool,
    pub server_finished_seen: bool,
    pub change_cipher_spec_seen: bool,
}

impl HandshakeState {
    pub fn is_complete(&self) -> bool {
        self.client_finished_seen && self.server_finished_seen
    }

    /// Fraction of the ten handshake milestones observed, 0-100.
    pub fn completion_percentage(&self) -> f64 {
        let milestones = [
            self.client_hello_seen,
            self.server_hello_seen,
            self.certificate_seen,
            self.server_key_exchange_seen,
            self.certificate_request_seen,
            self.server_hello_done_seen,
            self.client_key_exchange_seen,
            self.certificate_verify_seen,
            self.client_finished_seen,
            self.server_finished_seen,
        ];
        let set = milestones.iter().filter(|&&m| m).count();
        set as f64 / milestones.len() as f64 * 100.0
    }
}

/// Heuristic security findings.
#[derive(Debug, Clone, Default)]
pub struct TlsSecurityAnalysis {
    pub uses_weak_protocol: bool,
    pub uses_deprecated_cipher: bool,
    pub compression_enabled: bool,
    pub perfect_forward_secrecy: bool,
    pub heartbeat_enabled: bool,
    pub heartbleed_vulnerable: bool,
    pub poodle_vulnerable: bool,
    pub beast_vulnerable: bool,
    pub crime_vulnerable: bool,
    pub vulnerabilities: Vec<String>,
    /// 0-100.
    pub security_score: u32,
    pub security_grade: &'static str,
}

/// Accumulated TLS state for one connection.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub version: u16,
    pub record_type: u8,
    pub record_length: u16,
    pub handshake_type: Option<u8>,
    pub cipher_suites: Vec<CipherSuite>,
    pub offered_cipher_ids: Vec<u16>,
    pub selected_cipher: Option<CipherSuite>,
    pub compression_methods: Vec<u8>,
    pub session_id: Vec<u8>,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub extensions: Vec<TlsExtension>,
    /// Raw DER certificates from Certificate messages.
    pub certificate_chain: Vec<Vec<u8>>,
    pub handshake_state: HandshakeState,
    pub alert_level: u8,
    pub alert_description: u8,
    pub application_data_length: u32,
    pub is_encrypted: bool,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
    pub ja3: Option<String>,
    pub ja3_hash: Option<String>,
    pub security: TlsSecurityAnalysis,
    pub is_valid: bool,
    pub error_message: String,
}

impl TlsInfo {
    pub fn version_name(&self) -> &'static str {
        match self.version {
            VERSION_SSL3 => "SSLv3",
            VERSION_TLS10 => "TLS 1.0",
            VERSION_TLS11 => "TLS 1.1",
            VERSION_TLS12 => "TLS 1.2",
            VERSION_TLS13 => "TLS 1.3",
            _ => "unknown",
        }
    }
}

/// GREASE values reserved by RFC 8701; excluded from JA3.
fn is_grease(value: u16) -> bool {
    value & 0x0F0F == 0x0A0A
}

/// TLS deep inspector. One instance accumulates per-connection handshake
/// state into the caller-held [`TlsInfo`].
pub struct TlsInspector {
    cipher_db: HashMap<u16, CipherSuite>,
    scoring_enabled: bool,
}

impl TlsInspector {
    pub fn new() -> Self {
        Self {
            cipher_db: cipher_suite_database(),
            scoring_enabled: true,
        }
    }

    pub fn set_scoring_enabled(&mut self, enabled: bool) {
        self.scoring_enabled = enabled;
    }

    /// Cheap probe: record type, version range, plausible length.
    pub fn can_parse(&self, buffer: &ByteSlice<'_>) -> bool {
        if buffer.len() < RECORD_HEADER_SIZE {
            return false;
        }
        let content_type = buffer.read_u8(0);
        if !(RECORD_CHANGE_CIPHER_SPEC..=RECORD_HEARTBEAT).contains(&content_type) {
            return false;
        }
        let version = buffer.read_be16(1);
        if !(VERSION_SSL3..=VERSION_TLS13).contains(&version) {
            return false;
        }
        let length = buffer.read_be16(3);
        length > 0 && length <= MAX_RECORD_SIZE
    }

    /// Parse one TLS record into `info`, accumulating handshake state.
    /// Returns false (with `info.error_message` set) on malformed input.
    pub fn parse_record(&self, buffer: &ByteSlice<'_>, info: &mut TlsInfo) -> bool {
        if !self.can_parse(buffer) {
            info.error_message = "buffer does not contain a TLS record".into();
            info.is_valid = false;
            return false;
        }

        info.record_type = buffer.read_u8(0);
        info.version = buffer.read_be16(1);
        info.record_length = buffer.read_be16(3);

        if !buffer.can_read(usize::from(info.record_length), RECORD_HEADER_SIZE) {
            info.error_message = "TLS record truncated".into();
            info.is_valid = false;
            return false;
        }
        let record = buffer.slice(RECORD_HEADER_SIZE, usize::from(info.record_length));

        let ok = match info.record_type {
            RECORD_HANDSHAKE => self.parse_handshake(&record, info),
            RECORD_APPLICATION_DATA => {
                info.application_data_length = u32::from(info.record_length);
                info.is_encrypted = true;
                true
            }
            RECORD_ALERT => {
                if record.len() >= 2 {
                    info.alert_level = record.read_u8(0);
                    info.alert_description = record.read_u8(1);
                }
                true
            }
            RECORD_CHANGE_CIPHER_SPEC => {
                info.handshake_state.change_cipher_spec_seen = true;
                true
            }
            RECORD_HEARTBEAT => {
                info.security.heartbeat_enabled = true;
                true
            }
            _ => false,
        };

        if ok && self.scoring_enabled {
            self.analyze_security(info);
        }
        info.is_valid = ok;
        ok
    }

    fn parse_handshake(&self, record: &ByteSlice<'_>, info: &mut TlsInfo) -> bool {
        if record.len() < HANDSHAKE_HEADER_SIZE {
            info.error_message = "handshake message truncated".into();
            return false;
        }
        let handshake_type = record.read_u8(0);
        let length = ((u32::from(record.read_u8(1)) << 16)
            | (u32::from(record.read_u8(2)) << 8)
            | u32::from(record.read_u8(3))) as usize;
        if !record.can_read(length, HANDSHAKE_HEADER_SIZE) {
            info.error_message = "handshake body truncated".into();
            return false;
        }
        info.handshake_type = Some(handshake_type);
        let body = record.slice(HANDSHAKE_HEADER_SIZE, length);

        match handshake_type {
            HANDSHAKE_CLIENT_HELLO => {
                info.handshake_state.client_hello_seen = true;
                self.parse_client_hello(&body, info)
            }
            HANDSHAKE_SERVER_HELLO => {
                info.handshake_state.server_hello_seen = true;
                self.parse_server_hello(&body, info)
            }
            HANDSHAKE_CERTIFICATE => {
                info.handshake_state.certificate_seen = true;
                self.parse_certificate(&body, info)
            }
            HANDSHAKE_SERVER_KEY_EXCHANGE => {
                info.handshake_state.server_key_exchange_seen = true;
                true
            }
            HANDSHAKE_CERTIFICATE_REQUEST => {
                info.handshake_state.certificate_request_seen = true;
                true
            }
            HANDSHAKE_SERVER_HELLO_DONE => {
                info.handshake_state.server_hello_done_seen = true;
                true
            }
            HANDSHAKE_CLIENT_KEY_EXCHANGE => {
                info.handshake_state.client_key_exchange_seen = true;
                true
            }
            HANDSHAKE_CERTIFICATE_VERIFY => {
                info.handshake_state.certificate_verify_seen = true;
                true
            }
            HANDSHAKE_FINISHED => {
                // First Finished on a connection is the client's.
                if info.handshake_state.client_finished_seen {
                    info.handshake_state.server_finished_seen = true;
                } else {
                    info.handshake_state.client_finished_seen = true;
                }
                true
            }
            _ => true,
        }
    }

    fn parse_client_hello(&self, body: &ByteSlice<'_>, info: &mut TlsInfo) -> bool {
        if body.len() < 38 {
            info.error_message = "ClientHello truncated".into();
            return false;
        }
        info.version = body.read_be16(0);
        info.client_random
            .copy_from_slice(&body.as_bytes()[2..34]);

        let mut offset = 34;
        let session_id_len = usize::from(body.read_u8(offset));
        offset += 1;
        if !body.can_read(session_id_len, offset) {
            return false;
        }
        info.session_id = body.as_bytes()[offset..offset + session_id_len].to_vec();
        offset += session_id_len;

        if !body.can_read(2, offset) {
            return false;
        }
        let cipher_len = usize::from(body.read_be16(offset));
        offset += 2;
        if !body.can_read(cipher_len, offset) {
            return false;
        }
        for i in (0..cipher_len).step_by(2) {
            let id = body.read_be16(offset + i);
            info.offered_cipher_ids.push(id);
            if let Some(suite) = self.cipher_db.get(&id) {
                info.cipher_suites.push(suite.clone());
            }
        }
        offset += cipher_len;

        if !body.can_read(1, offset) {
            return false;
        }
        let compression_len = usize::from(body.read_u8(offset));
        offset += 1;
        if !body.can_read(compression_len, offset) {
            return false;
        }
        info.compression_methods = body.as_bytes()[offset..offset + compression_len].to_vec();
        offset += compression_len;

        if body.can_read(2, offset) {
            let extensions_len = usize::from(body.read_be16(offset));
            offset += 2;
            if body.can_read(extensions_len, offset) {
                let extensions = body.slice(offset, extensions_len);
                parse_extensions(&extensions, info);
            }
        }

        self.compute_ja3(info);
        true
    }

    fn parse_server_hello(&self, body: &ByteSlice<'_>, info: &mut TlsInfo) -> bool {
        if body.len() < 38 {
            info.error_message = "ServerHello truncated".into();
            return false;
        }
        info.version = body.read_be16(0);
        info.server_random
            .copy_from_slice(&body.as_bytes()[2..34]);

        let mut offset = 34;
        let session_id_len = usize::from(body.read_u8(offset));
        offset += 1 + session_id_len;

        if body.can_read(2, offset) {
            let id = body.read_be16(offset);
            info.selected_cipher = self.cipher_db.get(&id).cloned();
        }
        true
    }

    fn parse_certificate(&self, body: &ByteSlice<'_>, info: &mut TlsInfo) -> bool {
        if body.len() < 3 {
            return false;
        }
        let total = ((usize::from(body.read_u8(0)) << 16)
            | (usize::from(body.read_u8(1)) << 8)
            | usize::from(body.read_u8(2)))
        .min(body.len() - 3);

        let mut offset = 3;
        while offset + 3 <= 3 + total {
            let cert_len = (usize::from(body.read_u8(offset)) << 16)
                | (usize::from(body.read_u8(offset + 1)) << 8)
                | usize::from(body.read_u8(offset + 2));
            offset += 3;
            if !body.can_read(cert_len, offset) {
                break;
            }
            info.certificate_chain
                .push(body.as_bytes()[offset..offset + cert_len].to_vec());
            offset += cert_len;
        }
        true
    }

    /// JA3: md5("version,ciphers,extensions,groups,formats"), GREASE-free.
    fn compute_ja3(&self, info: &mut TlsInfo) {
        let join = |values: &[u16]| {
            values
                .iter()
                .filter(|&&v| !is_grease(v))
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("-")
        };
        let groups: Vec<u16> = info
            .extensions
            .iter()
            .flat_map(|e| e.supported_groups.iter().copied())
            .collect();
        let formats = info
            .extensions
            .iter()
            .flat_map(|e| e.ec_point_formats.iter())
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("-");
        let ext_types: Vec<u16> = info.extensions.iter().map(|e| e.ext_type).collect();

        let ja3 = format!(
            "{},{},{},{},{}",
            info.version,
            join(&info.offered_cipher_ids),
            join(&ext_types),
            join(&groups),
            formats
        );
        let digest = Md5::digest(ja3.as_bytes());
        info.ja3_hash = Some(hex::encode(digest));
        info.ja3 = Some(ja3);
    }

    /// Populate the layered heuristic analysis and the 0-100 score.
    fn analyze_security(&self, info: &mut TlsInfo) {
        let analysis = &mut info.security;
        analysis.vulnerabilities.clear();

        if info.version <= VERSION_TLS11 {
            analysis.uses_weak_protocol = true;
            analysis
                .vulnerabilities
                .push("deprecated protocol version".to_owned());
        }
        if info.version == VERSION_SSL3 {
            analysis.poodle_vulnerable = true;
            analysis.vulnerabilities.push("POODLE (SSLv3)".to_owned());
        }
        if info.version <= VERSION_TLS10 && info.version >= VERSION_SSL3 {
            analysis.beast_vulnerable = true;
        }

        let offered_weak = info.cipher_suites.iter().any(|s| s.is_weak());
        let selected_weak = info
            .selected_cipher
            .as_ref()
            .map(|s| s.is_weak())
            .unwrap_or(false);
        if offered_weak || selected_weak {
            analysis.uses_deprecated_cipher = true;
            analysis
                .vulnerabilities
                .push("weak cipher suite".to_owned());
        }

        if info.compression_methods.len() > 1 {
            analysis.compression_enabled = true;
            analysis.crime_vulnerable = true;
            analysis
                .vulnerabilities
                .push("compression enabled (CRIME)".to_owned());
        }

        analysis.perfect_forward_secrecy = info
            .selected_cipher
            .as_ref()
            .map(|s| s.supports_pfs)
            .unwrap_or_else(|| info.cipher_suites.iter().any(|s| s.supports_pfs));

        if analysis.heartbeat_enabled
            && (VERSION_TLS10..=VERSION_TLS12).contains(&info.version)
        {
            analysis.heartbleed_vulnerable = true;
            analysis
                .vulnerabilities
                .push("Heartbleed (CVE-2014-0160)".to_owned());
        }

        let mut score: u32 = 100;
        if info.version < VERSION_TLS12 {
            score = score.saturating_sub(40);
        }
        if analysis.uses_deprecated_cipher {
            score = score.saturating_sub(20);
        }
        if analysis.compression_enabled {
            score = score.saturating_sub(15);
        }
        if !analysis.perfect_forward_secrecy {
            score = score.saturating_sub(10);
        }
        if analysis.heartbleed_vulnerable {
            score = score.saturating_sub(25);
        }
        analysis.security_score = score;
        analysis.security_grade = grade(score);
    }
}

impl Default for TlsInspector {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_extensions(data: &ByteSlice<'_>, info: &mut TlsInfo) {
    let mut offset = 0;
    while data.can_read(4, offset) {
        let ext_type = data.read_be16(offset);
        let length = usize::from(data.read_be16(offset + 2));
        offset += 4;
        if !data.can_read(length, offset) {
            break;
        }
        let ext_data = &data.as_bytes()[offset..offset + length];
        let mut ext = TlsExtension {
            ext_type,
            data: ext_data.to_vec(),
            ..TlsExtension::default()
        };

        match ext_type {
            EXT_SERVER_NAME => {
                // server_name_list: len(2), type(1), name_len(2), name.
                if ext_data.len() > 5 {
                    let name_len =
                        (usize::from(ext_data[3]) << 8) | usize::from(ext_data[4]);
                    if 5 + name_len <= ext_data.len() {
                        let name =
                            String::from_utf8_lossy(&ext_data[5..5 + name_len]).into_owned();
                        info.server_name = Some(name.clone());
                        ext.server_name = Some(name);
                    }
                }
            }
            EXT_ALPN => {
                // protocol_name_list: len(2), then {len(1), name} entries.
                if ext_data.len() >= 2 {
                    let mut pos = 2;
                    while pos < ext_data.len() {
                        let len = usize::from(ext_data[pos]);
                        pos += 1;
                        if pos + len > ext_data.len() {
                            break;
                        }
                        let proto =
                            String::from_utf8_lossy(&ext_data[pos..pos + len]).into_owned();
                        info.alpn_protocols.push(proto.clone());
                        ext.alpn_protocols.push(proto);
                        pos += len;
                    }
                }
            }
            EXT_SUPPORTED_GROUPS => {
                if ext_data.len() >= 2 {
                    let list_len =
                        ((usize::from(ext_data[0]) << 8) | usize::from(ext_data[1]))
                            .min(ext_data.len() - 2);
                    for i in (0..list_len).step_by(2) {
                        if 2 + i + 1 < ext_data.len() {
                            ext.supported_groups.push(
                                (u16::from(ext_data[2 + i]) << 8)
                                    | u16::from(ext_data[2 + i + 1]),
                            );
                        }
                    }
                }
            }
            EXT_EC_POINT_FORMATS => {
                if !ext_data.is_empty() {
                    let count = usize::from(ext_data[0]).min(ext_data.len() - 1);
                    ext.ec_point_formats
                        .extend_from_slice(&ext_data[1..1 + count]);
                }
            }
            _ => {}
        }

        info.extensions.push(ext);
        offset += length;
    }
}

/// Grade bands over the 0-100 score.
pub fn grade(score: u32) -> &'static str {
    match score {
        95..=100 => "A+",
        80..=94 => "A",
        65..=79 => "B",
        50..=64 => "C",
        35..=49 => "D",
        _ => "F",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello(
        version: u16,
        cipher_ids: &[u16],
        compression: &[u8],
        extensions: &[u8],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0xAB; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&((cipher_ids.len() * 2) as u16).to_be_bytes());
        for id in cipher_ids {
            body.extend_from_slice(&id.to_be_bytes());
        }
        body.push(compression.len() as u8);
        body.extend_from_slice(compression);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![RECORD_HANDSHAKE];
        record.extend_from_slice(&version.to_be_bytes());
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn sni_extension(hostname: &str) -> Vec<u8> {
        let mut ext = Vec::new();
        ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        let name = hostname.as_bytes();
        let list_len = name.len() + 3;
        ext.extend_from_slice(&((list_len + 2) as u16).to_be_bytes()); // ext length
        ext.extend_from_slice(&(list_len as u16).to_be_bytes()); // list length
        ext.push(0); // host_name type
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);
        ext
    }

    #[test]
    fn test_client_hello_with_sni() {
        let record = client_hello(
            VERSION_TLS12,
            &[0xC02F, 0x009C],
            &[0],
            &sni_extension("example.com"),
        );
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();

        assert!(inspector.parse_record(&ByteSlice::borrowed(&record), &mut info));
        assert!(info.is_valid);
        assert!(info.handshake_state.client_hello_seen);
        assert_eq!(info.server_name.as_deref(), Some("example.com"));
        assert_eq!(info.extensions.len(), 1);
        assert_eq!(
            info.extensions[0].server_name.as_deref(),
            Some("example.com")
        );
        assert_eq!(info.cipher_suites.len(), 2);
        assert!(info.ja3.is_some());
        assert_eq!(info.ja3_hash.as_ref().map(String::len), Some(32));
    }

    #[test]
    fn test_tls12_strong_suite_scores_high() {
        let record = client_hello(VERSION_TLS12, &[0xC02F], &[0], &[]);
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut info);

        assert!(!info.security.uses_weak_protocol);
        assert!(info.security.perfect_forward_secrecy);
        assert_eq!(info.security.security_score, 100);
        assert_eq!(info.security.security_grade, "A+");
    }

    #[test]
    fn test_weak_version_and_cipher_deductions() {
        let record = client_hello(VERSION_TLS10, &[0x0005], &[0], &[]);
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut info);

        assert!(info.security.uses_weak_protocol);
        assert!(info.security.uses_deprecated_cipher);
        assert!(info.security.beast_vulnerable);
        // 100 - 40 (version) - 20 (cipher) - 10 (no PFS) = 30.
        assert_eq!(info.security.security_score, 30);
        assert_eq!(info.security.security_grade, "F");
    }

    #[test]
    fn test_compression_crime_deduction() {
        let record = client_hello(VERSION_TLS12, &[0xC02F], &[1, 0], &[]);
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut info);

        assert!(info.security.compression_enabled);
        assert!(info.security.crime_vulnerable);
        assert_eq!(info.security.security_score, 85);
    }

    #[test]
    fn test_scoring_monotonicity() {
        // Adding a vulnerability (heartbeat) never raises the score.
        let record = client_hello(VERSION_TLS12, &[0xC02F], &[0], &[]);
        let inspector = TlsInspector::new();

        let mut clean = TlsInfo::default();
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut clean);

        let mut with_heartbeat = TlsInfo::default();
        let heartbeat = [RECORD_HEARTBEAT, 0x03, 0x03, 0x00, 0x01, 0x01];
        inspector.parse_record(&ByteSlice::borrowed(&heartbeat), &mut with_heartbeat);
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut with_heartbeat);

        assert!(with_heartbeat.security.heartbleed_vulnerable);
        assert!(with_heartbeat.security.security_score <= clean.security.security_score);
    }

    #[test]
    fn test_finished_milestones_and_completion() {
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();

        let finished = |info: &mut TlsInfo| {
            let record = [
                RECORD_HANDSHAKE, 0x03, 0x03, 0x00, 0x04, HANDSHAKE_FINISHED, 0, 0, 0,
            ];
            inspector.parse_record(&ByteSlice::borrowed(&record), info);
        };

        assert!(!info.handshake_state.is_complete());
        finished(&mut info);
        assert!(info.handshake_state.client_finished_seen);
        assert!(!info.handshake_state.is_complete());
        finished(&mut info);
        assert!(info.handshake_state.server_finished_seen);
        assert!(info.handshake_state.is_complete());
        assert_eq!(info.handshake_state.completion_percentage(), 20.0);
    }

    #[test]
    fn test_alert_record() {
        let record = [RECORD_ALERT, 0x03, 0x03, 0x00, 0x02, 2, 40];
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        assert!(inspector.parse_record(&ByteSlice::borrowed(&record), &mut info));
        assert_eq!(info.alert_level, 2);
        assert_eq!(info.alert_description, 40);
    }

    #[test]
    fn test_application_data_record() {
        let mut record = vec![RECORD_APPLICATION_DATA, 0x03, 0x03, 0x00, 0x05];
        record.extend_from_slice(&[0xEE; 5]);
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        assert!(inspector.parse_record(&ByteSlice::borrowed(&record), &mut info));
        assert!(info.is_encrypted);
        assert_eq!(info.application_data_length, 5);
    }

    #[test]
    fn test_grease_filtered_from_ja3() {
        let record = client_hello(VERSION_TLS12, &[0x0A0A, 0xC02F], &[0], &[]);
        let inspector = TlsInspector::new();
        let mut info = TlsInfo::default();
        inspector.parse_record(&ByteSlice::borrowed(&record), &mut info);
        let ja3 = info.ja3.unwrap();
        assert!(!ja3.contains("2570")); // 0x0A0A
        assert!(ja3.contains("49199")); // 0xC02F
    }

    #[test]
    fn test_grade_bands() {
        assert_eq!(grade(100), "A+");
        assert_eq!(grade(95), "A+");
        assert_eq!(grade(80), "A");
        assert_eq!(grade(65), "B");
        assert_eq!(grade(50), "C");
        assert_eq!(grade(35), "D");
        assert_eq!(grade(34), "F");
    }
}
