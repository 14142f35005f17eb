//! The detection engine: runs the enabled detectors, merges same-protocol
//! verdicts with additive boosts, and returns the best surviving candidate.

use crate::deep::DeepInspector;
use crate::heuristic::HeuristicDetector;
use crate::port::PortDetector;
use crate::signature::{Signature, SignatureDetector};
use crate::types::{ConfidenceLevel, DetectionMethod, ProtocolFingerprint};
use arc_swap::ArcSwap;
use dissect_common::DetectError;
use dissect_core::ByteSlice;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Detector switches and thresholds, hot-swappable via [`DetectionEngine::configure`].
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub use_port_based: bool,
    pub use_signature_based: bool,
    pub use_heuristic_based: bool,
    pub use_deep_inspection: bool,
    pub enable_flow_analysis: bool,
    pub min_confidence_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            use_port_based: true,
            use_signature_based: true,
            use_heuristic_based: true,
            use_deep_inspection: true,
            enable_flow_analysis: false,
            min_confidence_threshold: 0.3,
        }
    }
}

/// Aggregate counters, guarded by one mutex; reads snapshot by clone.
#[derive(Debug, Clone, Default)]
pub struct DetectionStatistics {
    pub total_detections: u64,
    pub successful_detections: u64,
    pub port_based_detections: u64,
    pub signature_based_detections: u64,
    pub heuristic_detections: u64,
    pub deep_inspection_detections: u64,
    pub protocol_counts: HashMap<String, u64>,
}

/// Multi-stage protocol detection engine.
pub struct DetectionEngine {
    port_detector: PortDetector,
    signature_detector: Mutex<SignatureDetector>,
    heuristic_detector: HeuristicDetector,
    deep_inspector: Mutex<DeepInspector>,
    config: ArcSwap<DetectionConfig>,
    statistics: Mutex<DetectionStatistics>,
}

impl DetectionEngine {
    pub fn new() -> Self {
        Self {
            port_detector: PortDetector::with_standard_ports(),
            signature_detector: Mutex::new(SignatureDetector::with_builtin()),
            heuristic_detector: HeuristicDetector::new(),
            deep_inspector: Mutex::new(DeepInspector::with_standard_rules()),
            config: ArcSwap::from_pointee(DetectionConfig::default()),
            statistics: Mutex::new(DetectionStatistics::default()),
        }
    }

    /// Swap in a new configuration; in-flight detections keep the old one.
    pub fn configure(&self, config: DetectionConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn configuration(&self) -> DetectionConfig {
        self.config.load().as_ref().clone()
    }

    pub fn add_signature(&self, signature: Signature) -> Result<(), DetectError> {
        self.signature_detector.lock().add_signature(signature)
    }

    pub fn remove_signature(&self, protocol_name: &str) -> Result<(), DetectError> {
        self.signature_detector.lock().remove_signature(protocol_name)
    }

    /// Detect from payload bytes alone.
    pub fn detect(&self, buffer: &ByteSlice<'_>) -> ProtocolFingerprint {
        let config = self.config.load();
        let mut all = Vec::new();
        self.run_content_detectors(buffer, &config, &mut all);
        self.finish(buffer, all, &config)
    }

    /// Detect with src/dst port hints.
    pub fn detect_with_ports(
        &self,
        buffer: &ByteSlice<'_>,
        src_port: u16,
        dst_port: u16,
    ) -> ProtocolFingerprint {
        let config = self.config.load();
        let mut all = Vec::new();
        if config.use_port_based {
            all.extend(self.port_detector.detect(src_port, dst_port));
        }
        self.run_content_detectors(buffer, &config, &mut all);
        self.finish(buffer, all, &config)
    }

    /// Feed one packet of a flow into the deep inspector's state and return
    /// the flow-level verdict.
    pub fn detect_flow(
        &self,
        flow_id: &str,
        buffer: &ByteSlice<'_>,
        now_ms: u64,
    ) -> ProtocolFingerprint {
        let config = self.config.load();
        let mut all = Vec::new();
        if config.enable_flow_analysis {
            let mut inspector = self.deep_inspector.lock();
            inspector.update_flow(flow_id, buffer, now_ms);
            all.extend(inspector.analyze_flow(flow_id, now_ms));
        }
        self.run_content_detectors(buffer, &config, &mut all);
        self.finish(buffer, all, &config)
    }

    fn run_content_detectors(
        &self,
        buffer: &ByteSlice<'_>,
        config: &DetectionConfig,
        all: &mut Vec<ProtocolFingerprint>,
    ) {
        if config.use_signature_based {
            all.extend(
                self.signature_detector
                    .lock()
                    .detect(buffer, config.min_confidence_threshold),
            );
        }
        if config.use_heuristic_based {
            let features = self.heuristic_detector.extract_features(buffer);
            all.extend(self.heuristic_detector.detect(&features));
        }
        if config.use_deep_inspection {
            all.extend(self.deep_inspector.lock().inspect(buffer));
        }
    }

    fn finish(
        &self,
        buffer: &ByteSlice<'_>,
        all: Vec<ProtocolFingerprint>,
        config: &DetectionConfig,
    ) -> ProtocolFingerprint {
        let mut result = combine_results(all);
        result.bytes_analyzed = buffer.len();
        if result.score < config.min_confidence_threshold {
            tracing::trace!(
                best = %result.protocol_name,
                score = result.score,
                "no candidate above the confidence threshold"
            );
            result = ProtocolFingerprint {
                bytes_analyzed: buffer.len(),
                ..ProtocolFingerprint::default()
            };
        }
        self.update_statistics(&result, config);
        result
    }

    fn update_statistics(&self, result: &ProtocolFingerprint, config: &DetectionConfig) {
        let mut stats = self.statistics.lock();
        stats.total_detections += 1;
        if result.protocol_name.is_empty() || result.score < config.min_confidence_threshold {
            return;
        }
        stats.successful_detections += 1;
        *stats
            .protocol_counts
            .entry(result.protocol_name.clone())
            .or_insert(0) += 1;
        match result.method {
            DetectionMethod::Port => stats.port_based_detections += 1,
            DetectionMethod::Signature => stats.signature_based_detections += 1,
            DetectionMethod::Heuristic => stats.heuristic_detections += 1,
            DetectionMethod::Deep | DetectionMethod::Behavior => {
                stats.deep_inspection_detections += 1
            }
            DetectionMethod::Ml => {}
        }
    }

    /// Snapshot of the aggregate counters.
    pub fn statistics(&self) -> DetectionStatistics {
        self.statistics.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.statistics.lock() = DetectionStatistics::default();
    }

    pub fn supported_protocols(&self) -> Vec<String> {
        self.signature_detector.lock().signature_names()
    }
}

impl Default for DetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge by protocol name: the best-scoring candidate wins, agreeing
/// detectors add +0.1 each (capped at 1.0) and pool their evidence.
fn combine_results(mut results: Vec<ProtocolFingerprint>) -> ProtocolFingerprint {
    if results.is_empty() {
        return ProtocolFingerprint::default();
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut best = results.remove(0);
    for other in results {
        if other.protocol_name == best.protocol_name {
            best.score = (best.score + 0.1).min(1.0);
            best.evidence.extend(other.evidence);
        }
    }
    best.confidence = ConfidenceLevel::from_score(best.score);
    best
}
