// EGM Edge Agent Library
//
// Exposes modules for reuse and testing

pub mod aft;
pub mod bcd;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod ingress;
pub mod meters;
pub mod sink;
pub mod transport;
pub mod types;

// Re-export commonly used items for testing
pub use config::{Config, MeterListener};
pub use engine::{LinkState, PollEngine};
pub use frame::{decode, encode, DecodedFrame, ResponseShape};
pub use types::{AgentEvent, EngineCommand, EventKind, QueuedEvent};
