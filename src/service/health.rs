//! Health check reporting
//!
//! This module provides health check functionality for the rally-point
//! matchmaking service, gathered periodically and served by the metrics
//! endpoints.

use crate::engine::worker::EngineHandle;
use crate::metrics::MetricsCollector;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Parties currently queued, by bucket label
    pub queued_by_bucket: std::collections::HashMap<String, usize>,
    /// Total parties currently queued
    pub queued_parties: usize,
    /// Live session channels
    pub active_channels: i64,
    /// Connected clients across all channels
    pub connected_clients: i64,
    /// Total matches formed since start
    pub matches_formed: u64,
    /// Total queue timeouts since start
    pub queue_timeouts: u64,
    /// Service uptime in seconds
    pub uptime_seconds: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Service statistics
    pub stats: ServiceStats,
}

impl HealthReport {
    /// Gather a health report from the live components. The tick worker
    /// failing to answer marks the service unhealthy.
    pub async fn gather(
        service_name: &str,
        engine: &EngineHandle,
        metrics: &MetricsCollector,
        uptime_seconds: u64,
    ) -> Self {
        let (status, queued_by_bucket) = match engine.sizes().await {
            Ok(sizes) => (HealthStatus::Healthy, sizes),
            Err(e) => {
                debug!("Tick worker did not answer health probe: {}", e);
                (HealthStatus::Unhealthy, Default::default())
            }
        };

        let queued_parties = queued_by_bucket.values().sum();

        let stats = ServiceStats {
            queued_by_bucket,
            queued_parties,
            active_channels: metrics.channel().active_channels.get(),
            connected_clients: metrics.channel().connected_clients.get(),
            matches_formed: metrics.engine().matches_formed_total.get(),
            queue_timeouts: metrics.engine().queue_timeouts_total.get(),
            uptime_seconds,
        };

        metrics.update_health_status(match status {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        });

        Self {
            status,
            service: service_name.to_string(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::worker::spawn_engine;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_gather_healthy_report() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let (engine, _outcomes, _join) = spawn_engine(
            EngineSettings {
                tick_interval_ms: 3_600_000,
                ..EngineSettings::default()
            },
            metrics.clone(),
        );

        let report = HealthReport::gather("rally-point", &engine, &metrics, 5).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.stats.queued_parties, 0);
        assert_eq!(report.stats.uptime_seconds, 5);
    }

    #[tokio::test]
    async fn test_gather_unhealthy_when_worker_gone() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let (engine, _outcomes, join) = spawn_engine(
            EngineSettings {
                tick_interval_ms: 3_600_000,
                ..EngineSettings::default()
            },
            metrics.clone(),
        );

        engine.shutdown().await.unwrap();
        join.await.unwrap();

        let report = HealthReport::gather("rally-point", &engine, &metrics, 5).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }
}
