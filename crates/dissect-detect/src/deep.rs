//! Deep inspection: regex families and custom validators per protocol,
//! with flow-state accumulation across packets.

use crate::types::{DetectionMethod, ProtocolFingerprint};
use dissect_core::ByteSlice;
use lru::LruCache;
use regex::bytes::Regex;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Rules keep a bounded number of flows; idle flow state expires after this
/// window, aligned with the reassembler's inactivity timeout.
const FLOW_WINDOW_MS: u64 = 30_000;
const MAX_FLOWS: usize = 1024;

type Validator = Box<dyn Fn(&ByteSlice<'_>) -> bool + Send + Sync>;

/// One deep-inspection rule.
pub struct ProtocolRule {
    pub protocol_name: String,
    pub regex_patterns: Vec<Regex>,
    pub validator: Option<Validator>,
    /// Added to the flow's accumulated score on every matching packet.
    pub confidence_boost: f64,
}

impl ProtocolRule {
    fn matches(&self, buffer: &ByteSlice<'_>) -> bool {
        let data = buffer.as_bytes();
        let regex_hit = self.regex_patterns.iter().any(|re| re.is_match(data));
        let validator_hit = self
            .validator
            .as_ref()
            .map(|v| v(buffer))
            .unwrap_or(false);
        regex_hit || validator_hit
    }
}

#[derive(Debug, Default)]
struct FlowState {
    protocol_scores: HashMap<String, f64>,
    packet_count: usize,
    last_update_ms: u64,
}

/// Stateful deep inspector.
pub struct DeepInspector {
    rules: Vec<ProtocolRule>,
    flows: LruCache<String, FlowState>,
}

impl DeepInspector {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            flows: LruCache::new(NonZeroUsize::new(MAX_FLOWS).unwrap()),
        }
    }

    /// An inspector loaded with the standard rule set.
    pub fn with_standard_rules() -> Self {
        let mut inspector = Self::new();

        inspector.add_rule(ProtocolRule {
            protocol_name: "HTTP".to_owned(),
            regex_patterns: vec![
                Regex::new(r"(?i)^(GET|POST|PUT|DELETE|HEAD|OPTIONS|PATCH) \S+ HTTP/1\.[01]")
                    .expect("static regex"),
                Regex::new(r"^HTTP/1\.[01] \d{3} ").expect("static regex"),
            ],
            validator: None,
            confidence_boost: 0.3,
        });

        inspector.add_rule(ProtocolRule {
            protocol_name: "SIP".to_owned(),
            regex_patterns: vec![
                Regex::new(r"^(INVITE|REGISTER|OPTIONS|BYE|CANCEL|ACK) sip:").expect("static regex"),
                Regex::new(r"^SIP/2\.0 \d{3} ").expect("static regex"),
            ],
            validator: None,
            confidence_boost: 0.3,
        });

        inspector.add_rule(ProtocolRule {
            protocol_name: "TLS".to_owned(),
            regex_patterns: Vec::new(),
            validator: Some(Box::new(|buffer: &ByteSlice<'_>| {
                buffer.len() >= 5
                    && (20..=24).contains(&buffer.read_u8(0))
                    && buffer.read_u8(1) == 0x03
                    && buffer.read_u8(2) <= 0x04
            })),
            confidence_boost: 0.3,
        });

        inspector.add_rule(ProtocolRule {
            protocol_name: "DNS".to_owned(),
            regex_patterns: Vec::new(),
            validator: Some(Box::new(|buffer: &ByteSlice<'_>| {
                // Header shape: plausible opcode, sane counts.
                buffer.len() >= 12
                    && buffer.read_be16(4) <= 64 // QDCOUNT
                    && buffer.read_u8(2) & 0x78 <= 0x28 // opcode <= 5
            })),
            confidence_boost: 0.2,
        });

        inspector
    }

    pub fn add_rule(&mut self, rule: ProtocolRule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, protocol_name: &str) {
        self.rules.retain(|r| r.protocol_name != protocol_name);
    }

    /// Stateless single-buffer inspection.
    pub fn inspect(&self, buffer: &ByteSlice<'_>) -> Vec<ProtocolFingerprint> {
        let mut results = Vec::new();
        for rule in &self.rules {
            if rule.matches(buffer) {
                let mut fp = ProtocolFingerprint::new(
                    rule.protocol_name.clone(),
                    rule.confidence_boost,
                    DetectionMethod::Deep,
                );
                fp.bytes_analyzed = buffer.len();
                fp.evidence.push("deep inspection rule match".into());
                results.push(fp);
            }
        }
        results
    }

    /// Accumulate one packet into `flow_id`'s state.
    pub fn update_flow(&mut self, flow_id: &str, buffer: &ByteSlice<'_>, now_ms: u64) {
        // Expired state restarts from zero.
        if let Some(state) = self.flows.get(flow_id) {
            if now_ms.saturating_sub(state.last_update_ms) > FLOW_WINDOW_MS {
                self.flows.pop(flow_id);
            }
        }

        let matches: Vec<(String, f64)> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(buffer))
            .map(|rule| (rule.protocol_name.clone(), rule.confidence_boost))
            .collect();

        let state = self.flows.get_or_insert_mut(flow_id.to_owned(), FlowState::default);
        state.packet_count += 1;
        state.last_update_ms = now_ms;
        for (protocol, boost) in matches {
            let score = state.protocol_scores.entry(protocol).or_insert(0.0);
            *score = (*score + boost).min(1.0);
        }
    }

    /// Fingerprints accumulated for `flow_id`, if its state is still live.
    pub fn analyze_flow(&mut self, flow_id: &str, now_ms: u64) -> Vec<ProtocolFingerprint> {
        let Some(state) = self.flows.get(flow_id) else {
            return Vec::new();
        };
        if now_ms.saturating_sub(state.last_update_ms) > FLOW_WINDOW_MS {
            self.flows.pop(flow_id);
            return Vec::new();
        }
        state
            .protocol_scores
            .iter()
            .map(|(protocol, &score)| {
                let mut fp =
                    ProtocolFingerprint::new(protocol.clone(), score, DetectionMethod::Behavior);
                fp.evidence
                    .push(format!("accumulated over {} packets", state.packet_count));
                fp
            })
            .collect()
    }
}

impl Default for DeepInspector {
    fn default() -> Self {
        Self::with_standard_rules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_rule() {
        let inspector = DeepInspector::with_standard_rules();
        let results = inspector.inspect(&ByteSlice::borrowed(b"GET /index HTTP/1.1\r\n"));
        assert!(results.iter().any(|r| r.protocol_name == "HTTP"));
        let results = inspector.inspect(&ByteSlice::borrowed(b"HTTP/1.1 200 OK\r\n"));
        assert!(results.iter().any(|r| r.protocol_name == "HTTP"));
    }

    #[test]
    fn test_tls_validator() {
        let inspector = DeepInspector::with_standard_rules();
        let record = [0x16u8, 0x03, 0x03, 0x00, 0x10];
        let results = inspector.inspect(&ByteSlice::borrowed(&record));
        assert!(results.iter().any(|r| r.protocol_name == "TLS"));
    }

    #[test]
    fn test_flow_accumulation() {
        let mut inspector = DeepInspector::with_standard_rules();
        let packet = ByteSlice::borrowed(b"GET / HTTP/1.1\r\n");

        inspector.update_flow("flow-1", &packet, 1_000);
        inspector.update_flow("flow-1", &packet, 2_000);

        let results = inspector.analyze_flow("flow-1", 3_000);
        let http = results.iter().find(|r| r.protocol_name == "HTTP").unwrap();
        assert!((http.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_flow_expiration() {
        let mut inspector = DeepInspector::with_standard_rules();
        let packet = ByteSlice::borrowed(b"GET / HTTP/1.1\r\n");
        inspector.update_flow("flow-1", &packet, 1_000);
        // Window elapsed: state is gone.
        assert!(inspector.analyze_flow("flow-1", 40_000).is_empty());
    }

    #[test]
    fn test_flow_score_capped() {
        let mut inspector = DeepInspector::with_standard_rules();
        let packet = ByteSlice::borrowed(b"GET / HTTP/1.1\r\n");
        for i in 0..10 {
            inspector.update_flow("flow-1", &packet, 1_000 + i);
        }
        let results = inspector.analyze_flow("flow-1", 2_000);
        let http = results.iter().find(|r| r.protocol_name == "HTTP").unwrap();
        assert!(http.score <= 1.0);
    }
}
