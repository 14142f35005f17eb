//! Error types for misuse of the engine's shared resources.
//!
//! The per-packet parse path reports failures through
//! [`ParseOutcome`](crate::ParseOutcome); these enums cover the slower
//! control-plane surfaces (pool, registry, detector configuration) where a
//! structured error is worth the allocation.

use thiserror::Error;

/// Buffer pool failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("requested {0} bytes exceeds the largest size class")]
    OversizedRequest(usize),

    #[error("size class {0} exhausted and auto-expand is disabled")]
    Exhausted(usize),
}

/// Parser registry failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("protocol id {0:#06x} already has a registered factory")]
    Duplicate(u16),

    #[error("no factory registered for protocol id {0:#06x}")]
    Unknown(u16),
}

/// Detection engine failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("signature for {0:?} not found")]
    SignatureNotFound(String),

    #[error("signature pattern mask length {mask} does not match pattern length {pattern}")]
    MaskMismatch { pattern: usize, mask: usize },
}
