//! Link-layer dissectors.

pub mod ethernet;
