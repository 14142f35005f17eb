//! OpenDissect Core - zero-copy buffers for the dissection engine
//!
//! # Design
//!
//! - [`ByteSlice`]: a zero-copy view over packet bytes. Borrowed views are
//!   plain reborrows and never touch a refcount; shared views ride on
//!   [`bytes::Bytes`] so clones and sub-slices are O(1) atomic operations.
//! - [`simd`]: runtime-dispatched AVX2/SSE2 byte scanning with a scalar
//!   `memchr` fallback.
//! - [`BufferPool`]: four size classes with per-block CAS acquisition, a
//!   16-entry thread-local cache and RAII [`ScopedBuffer`] leases.
//!
//! Dissection itself lives in `dissect-protocols`; this crate knows nothing
//! about wire formats.

pub mod pool;
pub mod simd;
pub mod slice;

pub use pool::{BufferPool, PoolConfig, PoolStatsSnapshot, ScopedBuffer};
pub use slice::ByteSlice;
