//! OpenDissect Detect - multi-stage protocol identification
//!
//! Four cooperating detectors feed a combiner:
//!
//! - [`port::PortDetector`]: well-known port hints
//! - [`signature::SignatureDetector`]: masked byte patterns with weights
//! - [`heuristic::HeuristicDetector`]: entropy / printability / null-run
//!   statistics
//! - [`deep::DeepInspector`]: regex families, custom validators and per-flow
//!   accumulated scores
//!
//! [`engine::DetectionEngine`] merges their verdicts into one confidence-
//! banded [`ProtocolFingerprint`].

pub mod deep;
pub mod engine;
pub mod heuristic;
pub mod port;
pub mod signature;
pub mod types;

pub use engine::{DetectionConfig, DetectionEngine, DetectionStatistics};
pub use signature::{Signature, SignaturePattern};
pub use types::{ConfidenceLevel, DetectionMethod, ProtocolFingerprint};
