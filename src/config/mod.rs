//! Configuration management for the matchmaking service

pub mod app;

// Re-export commonly used types
pub use app::{
    AppConfig, BrokerSettings, ChannelSettings, EngineSettings, ServiceSettings, SnapshotSettings,
};
