//! OpenDissect Engine - the packet pipeline
//!
//! Wires the layers together: raw bytes enter as a [`ByteSlice`], the link
//! and network dissectors advance a shared [`ParseContext`], transport
//! payloads feed the flow tracker's reassemblers, and application payloads
//! are dispatched by port to the matching dissector or analyzer. Anything
//! unclassified falls through to the detection engine.
//!
//! ```text
//! bytes -> Ethernet -> IPv4/IPv6 -> TCP/UDP/... -> app dissector
//!                                       |              |
//!                                  reassembler     detector
//! ```

pub mod pipeline;

pub use pipeline::{PacketPipeline, PacketReport, PipelineStats, PipelineStatsSnapshot};

pub use dissect_core::ByteSlice;
pub use dissect_protocols::{LayerOutput, ParseContext};
