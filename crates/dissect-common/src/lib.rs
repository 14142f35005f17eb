//! OpenDissect Common - Shared types for the protocol dissection engine
//!
//! This crate provides the vocabulary every layer speaks:
//! - Parse outcomes and parser phases
//! - Error types for registry / pool / detector misuse
//! - Lock-free counters for statistics blocks
//! - Millisecond clock helpers (callers drive all protocol clocks)

pub mod error;

pub use error::{DetectError, PoolError, RegistryError};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a single parse step or a whole parse call.
///
/// The hot path never unwinds: dissectors report every failure mode through
/// this enum and the caller decides whether to salvage partial results from
/// the context metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParseOutcome {
    /// The step (or the whole parse) succeeded.
    Success,
    /// The buffer ends mid-structure; retry with more data.
    NeedMoreData,
    /// A wire field violates the protocol specification.
    InvalidFormat,
    /// A version field the dissector does not handle.
    UnsupportedVersion,
    /// A hard minimum size was not met.
    BufferTooSmall,
    /// Arithmetic overflow, table corruption or other unexpected state.
    InternalError,
}

impl ParseOutcome {
    /// True for `Success`.
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, ParseOutcome::Success)
    }
}

/// Phase of a dissector's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParsePhase {
    /// Nothing consumed yet.
    #[default]
    Initial,
    /// Header consumed, options/payload pending.
    Parsing,
    /// Terminal success state.
    Complete,
    /// Terminal failure state.
    Error,
}

impl ParsePhase {
    /// True for `Complete` and `Error`.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ParsePhase::Complete | ParsePhase::Error)
    }
}

/// Relaxed-ordering counter for statistics blocks.
///
/// Totals are eventually consistent; callers that need a coherent view take
/// a `snapshot()` of the owning statistics struct.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a counter starting at `value`.
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment by one, returning the previous value.
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `val`, returning the previous value.
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Subtract `val`, returning the previous value.
    #[inline(always)]
    pub fn sub(&self, val: u64) -> u64 {
        self.0.fetch_sub(val, Ordering::Relaxed)
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Raise the counter to `val` if it is currently lower.
    ///
    /// Used for peak-usage tracking.
    pub fn fetch_max(&self, val: u64) -> u64 {
        self.0.fetch_max(val, Ordering::Relaxed)
    }

    /// Reset to zero.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Protocol clocks (scan windows, replay detection, connection aging) are
/// driven by caller-supplied timestamps; this helper exists for callers that
/// have no better clock.
#[inline]
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
