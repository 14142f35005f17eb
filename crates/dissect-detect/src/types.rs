//! Detector verdict types.

use serde::{Deserialize, Serialize};

/// Banded confidence over the 0-1 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// Banding: >= 0.8 VeryHigh, >= 0.6 High, >= 0.4 Medium, >= 0.2 Low.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::VeryHigh
        } else if score >= 0.6 {
            Self::High
        } else if score >= 0.4 {
            Self::Medium
        } else if score >= 0.2 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

/// Which stage produced a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectionMethod {
    Port,
    Signature,
    Heuristic,
    Deep,
    Behavior,
    Ml,
}

/// The detector's verdict for one buffer or flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolFingerprint {
    pub protocol_name: String,
    pub confidence: ConfidenceLevel,
    /// Exact score in [0, 1].
    pub score: f64,
    pub detected_port: Option<u16>,
    pub method: DetectionMethod,
    pub evidence: Vec<String>,
    pub bytes_analyzed: usize,
}

impl ProtocolFingerprint {
    pub fn new(protocol_name: impl Into<String>, score: f64, method: DetectionMethod) -> Self {
        Self {
            protocol_name: protocol_name.into(),
            confidence: ConfidenceLevel::from_score(score),
            score,
            detected_port: None,
            method,
            evidence: Vec::new(),
            bytes_analyzed: 0,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.confidence >= ConfidenceLevel::High
    }
}

impl Default for ProtocolFingerprint {
    fn default() -> Self {
        Self {
            protocol_name: String::new(),
            confidence: ConfidenceLevel::VeryLow,
            score: 0.0,
            detected_port: None,
            method: DetectionMethod::Heuristic,
            evidence: Vec::new(),
            bytes_analyzed: 0,
        }
    }
}
