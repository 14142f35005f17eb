//! Industrial-protocol deep analyzers.

pub mod dnp3;
pub mod modbus;
