//! OpenDissect Protocols - layered wire-format dissectors
//!
//! Every dissector implements the uniform [`Dissector`](framework::Dissector)
//! contract: a cheap `can_parse` probe, a state-machine-driven `parse` that
//! advances a shared [`ParseContext`](framework::ParseContext), and a typed
//! result deposited in the context metadata under `"<proto>_result"`.
//!
//! Layers:
//!
//! - `link`: Ethernet II + 802.1Q
//! - `net`: IPv4, IPv6 (extension chain), ICMP, ICMPv6 (ND options)
//! - `transport`: TCP (options), UDP, SCTP (chunks), QUIC, RTP
//! - `app`: HTTP, DHCP, SNMP, gRPC, SIP
//! - `industrial`: Modbus/TCP and DNP3 deep analyzers
//! - `security`: TLS deep inspector, IPsec/IKE shells
//!
//! The industrial and security analyzers keep per-flow state (scan windows,
//! handshake milestones, replay windows) and are driven by caller-supplied
//! clocks; everything else is stateless per packet.

pub mod app;
pub mod framework;
pub mod industrial;
pub mod link;
pub mod net;
pub mod security;
pub mod transport;

pub use framework::{
    Dissector, LayerOutput, ParseContext, ParserRegistry, ProtocolInfo, StateMachine,
};
