//! Metrics and monitoring for the rally-point matchmaking service
//!
//! This module provides metrics collection and the health/metrics HTTP
//! endpoints for the service.

pub mod collector;
pub mod health;

pub use collector::{ChannelMetrics, EngineMetrics, MetricsCollector, ServiceMetrics};
pub use health::{HealthServer, HealthServerConfig};
