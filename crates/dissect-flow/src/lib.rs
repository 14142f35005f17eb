//! OpenDissect Flow - TCP stream reassembly and connection tracking
//!
//! [`TcpReassembler`] restores an in-order byte stream from out-of-order,
//! duplicated and overlapping segments, per flow direction.
//! [`ConnectionTracker`] keys bidirectional reassembler pairs by 5-tuple and
//! sweeps idle connections using caller-supplied clocks.

pub mod reassembly;
pub mod tracker;

pub use reassembly::{ReassemblerConfig, ReassemblyStats, TcpReassembler, TcpSegment, WindowInfo};
pub use tracker::{Connection, ConnectionTracker, Direction, FlowKey};
