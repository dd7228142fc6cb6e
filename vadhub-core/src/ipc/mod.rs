//! Typed message and event surface between the transport and the engine.

pub mod events;
pub mod messages;

pub use events::{DebugState, VadEvent};
pub use messages::ClientMessage;
