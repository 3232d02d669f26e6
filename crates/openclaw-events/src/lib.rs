//! Event types and the in-process event log.
//!
//! The engine publishes lifecycle events here; the HTTP surface tails them
//! (`/events`) and streams them live (`/stream`). Consumers that lag are
//! dropped behind, never block the publisher.

pub mod events;
pub mod log;

pub use events::Event;
pub use log::{EventLog, EventRecord};
