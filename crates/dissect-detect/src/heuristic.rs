//! Statistical heuristics: byte frequency, entropy, printability, null runs
//! and plausible ASCII strings.

use crate::types::{DetectionMethod, ProtocolFingerprint};
use dissect_core::ByteSlice;

const MIN_STRING_LENGTH: usize = 4;

/// Extracted per-buffer statistics.
#[derive(Debug, Clone)]
pub struct PacketFeatures {
    pub packet_size: usize,
    /// Shannon entropy over bytes, 0-8 bits.
    pub entropy: f64,
    pub byte_frequency: [u32; 256],
    pub printable_chars: usize,
    pub null_bytes: usize,
    pub max_consecutive_zeros: usize,
    pub has_header_separators: bool,
    pub strings: Vec<String>,
}

impl PacketFeatures {
    pub fn printable_ratio(&self) -> f64 {
        if self.packet_size == 0 {
            return 0.0;
        }
        self.printable_chars as f64 / self.packet_size as f64
    }

    pub fn null_ratio(&self) -> f64 {
        if self.packet_size == 0 {
            return 0.0;
        }
        self.null_bytes as f64 / self.packet_size as f64
    }
}

fn is_printable_ascii(byte: u8) -> bool {
    (32..=126).contains(&byte)
}

/// Shannon entropy over the byte distribution.
pub fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut frequency = [0u32; 256];
    for &byte in data {
        frequency[usize::from(byte)] += 1;
    }
    let len = data.len() as f64;
    frequency
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = f64::from(count) / len;
            -p * p.log2()
        })
        .sum()
}

/// Heuristic classifier.
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn extract_features(&self, buffer: &ByteSlice<'_>) -> PacketFeatures {
        let data = buffer.as_bytes();
        let mut features = PacketFeatures {
            packet_size: data.len(),
            entropy: 0.0,
            byte_frequency: [0; 256],
            printable_chars: 0,
            null_bytes: 0,
            max_consecutive_zeros: 0,
            has_header_separators: false,
            strings: Vec::new(),
        };
        if data.is_empty() {
            return features;
        }

        let mut current_zeros = 0usize;
        let mut current_string = String::new();
        for &byte in data {
            features.byte_frequency[usize::from(byte)] += 1;
            if byte == 0 {
                features.null_bytes += 1;
                current_zeros += 1;
            } else {
                features.max_consecutive_zeros =
                    features.max_consecutive_zeros.max(current_zeros);
                current_zeros = 0;
            }
            if is_printable_ascii(byte) {
                features.printable_chars += 1;
                current_string.push(char::from(byte));
            } else {
                if current_string.len() >= MIN_STRING_LENGTH {
                    features.strings.push(std::mem::take(&mut current_string));
                }
                current_string.clear();
            }
        }
        features.max_consecutive_zeros = features.max_consecutive_zeros.max(current_zeros);
        if current_string.len() >= MIN_STRING_LENGTH {
            features.strings.push(current_string);
        }

        features.entropy = entropy(data);
        features.has_header_separators = data
            .windows(2)
            .take(64)
            .any(|w| w == b": " || w == b"\r\n");

        features
    }

    /// Classify from the extracted features.
    pub fn detect(&self, features: &PacketFeatures) -> Vec<ProtocolFingerprint> {
        let mut results = Vec::new();
        if features.packet_size == 0 {
            return results;
        }

        // Text-like: low entropy and mostly printable.
        if features.entropy < 3.0 && features.printable_ratio() > 0.7 {
            let mut fp = ProtocolFingerprint::new("TEXT_BASED", 0.6, DetectionMethod::Heuristic);
            fp.evidence.push("high printable character ratio".into());
            fp.evidence
                .push(format!("low entropy: {:.2}", features.entropy));
            results.push(fp);
        } else if features.entropy > 6.0 {
            // Encryption or compression.
            let mut fp = ProtocolFingerprint::new(
                "ENCRYPTED_OR_COMPRESSED",
                0.7,
                DetectionMethod::Heuristic,
            );
            fp.evidence
                .push(format!("high entropy: {:.2}", features.entropy));
            results.push(fp);
        }

        // Structured binary: many nulls and long zero runs.
        if features.null_ratio() > 0.1 && features.max_consecutive_zeros > 8 {
            let mut fp =
                ProtocolFingerprint::new("BINARY_PROTOCOL", 0.5, DetectionMethod::Heuristic);
            fp.evidence.push(format!(
                "null ratio {:.2}, zero run {}",
                features.null_ratio(),
                features.max_consecutive_zeros
            ));
            results.push(fp);
        }

        for fp in &mut results {
            fp.bytes_analyzed = features.packet_size;
        }
        results
    }
}

impl Default for HeuristicDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_extremes() {
        assert_eq!(entropy(&[]), 0.0);
        assert_eq!(entropy(&[7u8; 64]), 0.0);
        // A full byte sweep has exactly 8 bits of entropy.
        let sweep: Vec<u8> = (0..=255u8).collect();
        assert!((entropy(&sweep) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_text_classification() {
        let detector = HeuristicDetector::new();
        // A small alphabet keeps the entropy under the 3.0-bit gate.
        let text = b"AAAA: BBBB\r\nAAAA: BBBB\r\n";
        let features = detector.extract_features(&ByteSlice::borrowed(text));
        assert!(features.printable_ratio() > 0.7);
        assert!(features.entropy < 3.0);
        assert!(features.has_header_separators);

        let results = detector.detect(&features);
        assert!(results.iter().any(|r| r.protocol_name == "TEXT_BASED"));
    }

    #[test]
    fn test_high_entropy_classification() {
        // A pseudo-random sweep with a full alphabet reads as encrypted.
        let data: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 16) as u8)
            .collect();
        let detector = HeuristicDetector::new();
        let features = detector.extract_features(&ByteSlice::borrowed(&data));
        assert!(features.entropy > 6.0);
        let results = detector.detect(&features);
        assert!(results
            .iter()
            .any(|r| r.protocol_name == "ENCRYPTED_OR_COMPRESSED"));
    }

    #[test]
    fn test_binary_classification() {
        let mut data = vec![0u8; 40];
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let detector = HeuristicDetector::new();
        let features = detector.extract_features(&ByteSlice::borrowed(&data));
        assert!(features.max_consecutive_zeros >= 40);
        let results = detector.detect(&features);
        assert!(results.iter().any(|r| r.protocol_name == "BINARY_PROTOCOL"));
    }

    #[test]
    fn test_string_extraction() {
        let data = b"\x00\x01example.com\x00\x02ab\x00more-text\x00";
        let detector = HeuristicDetector::new();
        let features = detector.extract_features(&ByteSlice::borrowed(data));
        assert_eq!(features.strings, vec!["example.com", "more-text"]);
    }
}
