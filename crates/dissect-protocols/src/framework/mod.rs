//! Parser framework: the uniform dissector contract, the context threaded
//! through layers, the per-parser state machine and the factory registry.

mod context;
mod dissector;
mod registry;

pub use context::{LayerOutput, ParseContext};
pub use dissector::{Dissector, ProtocolInfo, StateMachine};
pub use registry::ParserRegistry;
