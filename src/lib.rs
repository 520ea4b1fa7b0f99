//! Rally Point - Real-time multiplayer matchmaking service
//!
//! This crate provides a tick-driven matchmaking engine that groups waiting
//! parties into balanced teams under MMR tolerance, plus the party state
//! machine and real-time event fan-out around it.

pub mod adapters;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod party;
pub mod queue;
pub mod service;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use engine::worker::EngineHandle;
pub use events::publisher::EventPublisher;
pub use party::machine::PartyRegistry;
pub use queue::store::QueueStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
