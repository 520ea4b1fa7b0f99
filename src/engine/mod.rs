//! The matchmaking tick engine
//!
//! `tick` holds the synchronous per-tick algorithm over the queue store;
//! `worker` wraps it in a dedicated task with a bounded command mailbox so
//! the store has a single writer.

pub mod tick;
pub mod worker;

// Re-export commonly used types
pub use tick::{TickEngine, TickReport};
pub use worker::{spawn_engine, EngineCommand, EngineHandle, TickOutcome};
