//! Byte-signature matching with masks, bounded search and weighted scoring.

use crate::types::{DetectionMethod, ProtocolFingerprint};
use aho_corasick::AhoCorasick;
use dissect_common::DetectError;
use dissect_core::ByteSlice;

/// One pattern of a signature.
#[derive(Debug, Clone)]
pub struct SignaturePattern {
    pub bytes: Vec<u8>,
    /// Per-byte mask; 0xFF bits must match. Empty means all-0xFF.
    pub mask: Vec<u8>,
    /// Where the pattern anchors (or where the search window begins).
    pub offset: usize,
    /// 0 anchors the pattern at `offset`; otherwise the number of candidate
    /// positions searched starting there.
    pub max_search_range: usize,
    pub weight: f64,
    pub description: String,
}

impl SignaturePattern {
    /// Anchored pattern with an all-0xFF mask.
    pub fn exact(bytes: impl Into<Vec<u8>>, offset: usize, weight: f64) -> Self {
        Self {
            bytes: bytes.into(),
            mask: Vec::new(),
            offset,
            max_search_range: 0,
            weight,
            description: String::new(),
        }
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True when the mask is absent or trivially all-0xFF.
    pub fn is_unmasked(&self) -> bool {
        self.mask.is_empty() || self.mask.iter().all(|&m| m == 0xFF)
    }

    fn mask_byte(&self, index: usize) -> u8 {
        self.mask.get(index).copied().unwrap_or(0xFF)
    }

    /// Anchored match at `offset`.
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.offset + self.bytes.len() > data.len() {
            return false;
        }
        self.bytes.iter().enumerate().all(|(i, &pattern_byte)| {
            let mask = self.mask_byte(i);
            data[self.offset + i] & mask == pattern_byte & mask
        })
    }

    /// Match at the anchor or anywhere within the bounded search range.
    pub fn search_matches(&self, data: &[u8]) -> bool {
        if self.bytes.is_empty() || data.len() < self.bytes.len() {
            return false;
        }
        if self.max_search_range == 0 {
            return self.matches(data);
        }
        let last_start = data.len() - self.bytes.len();
        let search_end = (self.offset + self.max_search_range).min(last_start + 1);
        (self.offset..search_end).any(|start| {
            self.bytes.iter().enumerate().all(|(i, &pattern_byte)| {
                let mask = self.mask_byte(i);
                data[start + i] & mask == pattern_byte & mask
            })
        })
    }
}

/// Named list of weighted patterns.
#[derive(Debug, Clone)]
pub struct Signature {
    pub protocol_name: String,
    pub patterns: Vec<SignaturePattern>,
    pub typical_ports: Vec<u16>,
    pub base_confidence: f64,
}

impl Signature {
    pub fn new(protocol_name: impl Into<String>, base_confidence: f64) -> Self {
        Self {
            protocol_name: protocol_name.into(),
            patterns: Vec::new(),
            typical_ports: Vec::new(),
            base_confidence,
        }
    }

    pub fn with_pattern(mut self, pattern: SignaturePattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.typical_ports.extend_from_slice(ports);
        self
    }

    /// `mask.len == bytes.len` (or absent) must hold for every pattern.
    pub fn validate(&self) -> Result<(), DetectError> {
        for pattern in &self.patterns {
            if !pattern.mask.is_empty() && pattern.mask.len() != pattern.bytes.len() {
                return Err(DetectError::MaskMismatch {
                    pattern: pattern.bytes.len(),
                    mask: pattern.mask.len(),
                });
            }
        }
        Ok(())
    }

    /// `sum(weight x matched) / sum(weight) x base_confidence`.
    pub fn match_score(&self, buffer: &ByteSlice<'_>) -> f64 {
        let data = buffer.as_bytes();
        let mut total_weight = 0.0;
        let mut matched_weight = 0.0;
        for pattern in &self.patterns {
            total_weight += pattern.weight;
            if pattern.search_matches(data) {
                matched_weight += pattern.weight;
            }
        }
        if total_weight == 0.0 {
            return 0.0;
        }
        matched_weight / total_weight * self.base_confidence
    }
}

/// Signature store with an Aho-Corasick prefilter over unmasked anchored
/// literals: buffers that cannot contain any literal skip the per-signature
/// scan entirely.
pub struct SignatureDetector {
    signatures: Vec<Signature>,
    prefilter: Option<AhoCorasick>,
    /// Signature indices with at least one prefilterable literal.
    literal_owners: Vec<usize>,
}

impl SignatureDetector {
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
            prefilter: None,
            literal_owners: Vec::new(),
        }
    }

    /// A detector loaded with the built-in signature set.
    pub fn with_builtin() -> Self {
        let mut detector = Self::new();
        for signature in builtin_signatures() {
            detector
                .add_signature(signature)
                .expect("builtin signatures are valid");
        }
        detector
    }

    pub fn add_signature(&mut self, signature: Signature) -> Result<(), DetectError> {
        signature.validate()?;
        self.signatures.push(signature);
        self.rebuild_prefilter();
        Ok(())
    }

    pub fn remove_signature(&mut self, protocol_name: &str) -> Result<(), DetectError> {
        let before = self.signatures.len();
        self.signatures.retain(|s| s.protocol_name != protocol_name);
        if self.signatures.len() == before {
            return Err(DetectError::SignatureNotFound(protocol_name.to_owned()));
        }
        self.rebuild_prefilter();
        Ok(())
    }

    pub fn signature_names(&self) -> Vec<String> {
        self.signatures
            .iter()
            .map(|s| s.protocol_name.clone())
            .collect()
    }

    fn rebuild_prefilter(&mut self) {
        let mut literals = Vec::new();
        let mut owners = Vec::new();
        for (index, signature) in self.signatures.iter().enumerate() {
            for pattern in &signature.patterns {
                if pattern.is_unmasked() && !pattern.bytes.is_empty() {
                    literals.push(pattern.bytes.clone());
                    owners.push(index);
                }
            }
        }
        self.prefilter = if literals.is_empty() {
            None
        } else {
            AhoCorasick::new(&literals).ok()
        };
        self.literal_owners = owners;
    }

    /// Score every signature against `buffer`, keeping those above
    /// `min_score`.
    pub fn detect(&self, buffer: &ByteSlice<'_>, min_score: f64) -> Vec<ProtocolFingerprint> {
        let data = buffer.as_bytes();

        // Signatures with prefilterable literals only need scoring when one
        // of their literals occurs at all.
        let mut candidates: Vec<bool> = vec![true; self.signatures.len()];
        if let Some(prefilter) = &self.prefilter {
            let mut hit = vec![false; self.signatures.len()];
            for found in prefilter.find_overlapping_iter(data) {
                hit[self.literal_owners[found.pattern().as_usize()]] = true;
            }
            for (index, signature) in self.signatures.iter().enumerate() {
                let has_literal = self.literal_owners.contains(&index);
                if has_literal && !hit[index] {
                    // A masked pattern may still match; only skip signatures
                    // made entirely of literals.
                    if signature.patterns.iter().all(|p| p.is_unmasked()) {
                        candidates[index] = false;
                    }
                }
            }
        }

        let mut results = Vec::new();
        for (index, signature) in self.signatures.iter().enumerate() {
            if !candidates[index] {
                continue;
            }
            let score = signature.match_score(buffer);
            if score > min_score {
                let mut fingerprint = ProtocolFingerprint::new(
                    signature.protocol_name.clone(),
                    score,
                    DetectionMethod::Signature,
                );
                fingerprint.bytes_analyzed = data.len();
                fingerprint
                    .evidence
                    .push(format!("signature match ({:.2})", score));
                results.push(fingerprint);
            }
        }
        results
    }
}

impl Default for SignatureDetector {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// The built-in signature set.
pub fn builtin_signatures() -> Vec<Signature> {
    vec![
        Signature::new("HTTP", 0.8)
            .with_ports(&[80, 8080])
            .with_pattern(SignaturePattern::exact(*b"GET ", 0, 1.0).described("HTTP GET method"))
            .with_pattern(SignaturePattern::exact(*b"POST ", 0, 1.0).described("HTTP POST method")),
        Signature::new("TLS", 0.85)
            .with_ports(&[443, 8443])
            .with_pattern(
                SignaturePattern {
                    bytes: vec![0x16, 0x03, 0x00],
                    mask: vec![0xFF, 0xFF, 0xFC],
                    offset: 0,
                    max_search_range: 0,
                    weight: 1.0,
                    description: "TLS handshake record".to_owned(),
                },
            ),
        Signature::new("DHCP", 0.9)
            .with_ports(&[67, 68])
            .with_pattern(
                SignaturePattern::exact([0x63, 0x82, 0x53, 0x63], 236, 1.0)
                    .described("DHCP magic cookie"),
            ),
        Signature::new("SNMP", 0.6)
            .with_ports(&[161, 162])
            .with_pattern(SignaturePattern::exact([0x30], 0, 0.6).described("BER SEQUENCE tag")),
        Signature::new("SSH", 0.9)
            .with_ports(&[22])
            .with_pattern(SignaturePattern::exact(*b"SSH-", 0, 1.0).described("SSH banner")),
        Signature::new("DNP3", 0.9)
            .with_ports(&[20000])
            .with_pattern(
                SignaturePattern::exact([0x05, 0x64], 0, 1.0).described("DNP3 start bytes"),
            ),
        Signature::new("Modbus", 0.7)
            .with_ports(&[502])
            .with_pattern(
                SignaturePattern {
                    bytes: vec![0x00, 0x00],
                    mask: vec![0xFF, 0xFF],
                    offset: 2,
                    max_search_range: 0,
                    weight: 1.0,
                    description: "MBAP protocol id".to_owned(),
                },
            ),
        Signature::new("SIP", 0.85)
            .with_ports(&[5060])
            .with_pattern(SignaturePattern::exact(*b"INVITE sip:", 0, 1.0).described("SIP INVITE"))
            .with_pattern(SignaturePattern::exact(*b"SIP/2.0", 0, 1.0).described("SIP status line"))
            .with_pattern(
                SignaturePattern::exact(*b"REGISTER sip:", 0, 1.0).described("SIP REGISTER"),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchored_match() {
        let pattern = SignaturePattern::exact(*b"GET ", 0, 1.0);
        assert!(pattern.matches(b"GET /index.html"));
        assert!(!pattern.matches(b"PUT /index.html"));
        assert!(!pattern.matches(b"GE"));
    }

    #[test]
    fn test_masked_match() {
        // High nibble only.
        let pattern = SignaturePattern {
            bytes: vec![0x40],
            mask: vec![0xF0],
            offset: 0,
            max_search_range: 0,
            weight: 1.0,
            description: String::new(),
        };
        assert!(pattern.matches(&[0x45]));
        assert!(pattern.matches(&[0x4F]));
        assert!(!pattern.matches(&[0x60]));
    }

    #[test]
    fn test_bounded_search() {
        let pattern = SignaturePattern {
            bytes: b"abc".to_vec(),
            mask: Vec::new(),
            offset: 0,
            max_search_range: 4,
            weight: 1.0,
            description: String::new(),
        };
        assert!(pattern.search_matches(b"xxxabcyy"));
        assert!(!pattern.search_matches(b"xxxxabc")); // beyond range
    }

    #[test]
    fn test_weighted_score() {
        let signature = Signature::new("X", 0.8)
            .with_pattern(SignaturePattern::exact(*b"AB", 0, 3.0))
            .with_pattern(SignaturePattern::exact(*b"ZZ", 4, 1.0));
        // Only the weight-3 pattern matches: 3/4 * 0.8 = 0.6.
        let score = signature.match_score(&ByteSlice::borrowed(b"ABxxYY"));
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_mask_length_validation() {
        let signature = Signature::new("bad", 0.5).with_pattern(SignaturePattern {
            bytes: vec![1, 2, 3],
            mask: vec![0xFF],
            offset: 0,
            max_search_range: 0,
            weight: 1.0,
            description: String::new(),
        });
        assert!(matches!(
            signature.validate(),
            Err(DetectError::MaskMismatch { pattern: 3, mask: 1 })
        ));
    }

    #[test]
    fn test_builtin_http_detection() {
        let detector = SignatureDetector::with_builtin();
        let results = detector.detect(&ByteSlice::borrowed(b"GET / HTTP/1.1\r\n"), 0.2);
        assert!(results.iter().any(|r| r.protocol_name == "HTTP"));
    }

    #[test]
    fn test_builtin_dnp3_detection() {
        let frame = [0x05u8, 0x64, 0x0E, 0x44, 0x0A, 0x00, 0x01, 0x00];
        let detector = SignatureDetector::with_builtin();
        let results = detector.detect(&ByteSlice::borrowed(&frame), 0.2);
        assert!(results.iter().any(|r| r.protocol_name == "DNP3"));
    }

    #[test]
    fn test_remove_signature() {
        let mut detector = SignatureDetector::with_builtin();
        assert!(detector.remove_signature("SSH").is_ok());
        assert!(matches!(
            detector.remove_signature("SSH"),
            Err(DetectError::SignatureNotFound(_))
        ));
        let results = detector.detect(&ByteSlice::borrowed(b"SSH-2.0-OpenSSH"), 0.2);
        assert!(results.iter().all(|r| r.protocol_name != "SSH"));
    }
}
