//! Security-protocol deep analyzers.

pub mod ipsec;
pub mod tls;
