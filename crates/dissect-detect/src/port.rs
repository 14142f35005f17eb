//! Port-based detection from well-known assignments.

use crate::types::{DetectionMethod, ProtocolFingerprint};
use std::collections::HashMap;

/// Map from port to candidate protocols with base confidence.
pub struct PortDetector {
    port_to_protocols: HashMap<u16, Vec<(String, f64)>>,
}

impl PortDetector {
    pub fn new() -> Self {
        Self {
            port_to_protocols: HashMap::new(),
        }
    }

    /// A detector loaded with the standard assignments.
    pub fn with_standard_ports() -> Self {
        let mut detector = Self::new();
        let standard: &[(u16, &str, f64)] = &[
            // Web
            (80, "HTTP", 0.9),
            (443, "HTTPS", 0.9),
            (8080, "HTTP", 0.7),
            (8443, "HTTPS", 0.7),
            // Mail
            (25, "SMTP", 0.9),
            (110, "POP3", 0.9),
            (143, "IMAP", 0.9),
            (993, "IMAPS", 0.9),
            (995, "POP3S", 0.9),
            // Network management
            (161, "SNMP", 0.9),
            (162, "SNMP-TRAP", 0.9),
            (67, "DHCP", 0.9),
            (68, "DHCP", 0.9),
            // Classics
            (21, "FTP", 0.9),
            (22, "SSH", 0.9),
            (23, "TELNET", 0.9),
            (53, "DNS", 0.9),
            (69, "TFTP", 0.8),
            // Industrial
            (502, "Modbus", 0.9),
            (20000, "DNP3", 0.9),
            // Security
            (500, "IKE", 0.9),
            (4500, "IKE-NAT-T", 0.9),
            // Media / signalling
            (5060, "SIP", 0.9),
            (5004, "RTP", 0.7),
        ];
        for &(port, protocol, confidence) in standard {
            detector.add_port_mapping(port, protocol, confidence);
        }
        detector
    }

    pub fn add_port_mapping(&mut self, port: u16, protocol: impl Into<String>, confidence: f64) {
        self.port_to_protocols
            .entry(port)
            .or_default()
            .push((protocol.into(), confidence));
    }

    pub fn remove_port_mapping(&mut self, port: u16, protocol: &str) {
        if let Some(protocols) = self.port_to_protocols.get_mut(&port) {
            protocols.retain(|(name, _)| name != protocol);
            if protocols.is_empty() {
                self.port_to_protocols.remove(&port);
            }
        }
    }

    /// Candidates for both endpoints of a flow.
    pub fn detect(&self, src_port: u16, dst_port: u16) -> Vec<ProtocolFingerprint> {
        let mut results = Vec::new();
        for port in [src_port, dst_port] {
            if let Some(protocols) = self.port_to_protocols.get(&port) {
                for (protocol, confidence) in protocols {
                    let mut fingerprint = ProtocolFingerprint::new(
                        protocol.clone(),
                        *confidence,
                        DetectionMethod::Port,
                    );
                    fingerprint.detected_port = Some(port);
                    fingerprint.evidence.push(format!("standard port {port}"));
                    results.push(fingerprint);
                }
            }
        }
        results
    }
}

impl Default for PortDetector {
    fn default() -> Self {
        Self::with_standard_ports()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_ports() {
        let detector = PortDetector::with_standard_ports();
        let results = detector.detect(49152, 80);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].protocol_name, "HTTP");
        assert_eq!(results[0].detected_port, Some(80));
        assert!((results[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_both_ports_queried() {
        let detector = PortDetector::with_standard_ports();
        let results = detector.detect(502, 20000);
        let names: Vec<_> = results.iter().map(|r| r.protocol_name.as_str()).collect();
        assert!(names.contains(&"Modbus"));
        assert!(names.contains(&"DNP3"));
    }

    #[test]
    fn test_add_remove_mapping() {
        let mut detector = PortDetector::new();
        detector.add_port_mapping(9999, "CUSTOM", 0.5);
        assert_eq!(detector.detect(9999, 0).len(), 1);
        detector.remove_port_mapping(9999, "CUSTOM");
        assert!(detector.detect(9999, 0).is_empty());
    }
}
