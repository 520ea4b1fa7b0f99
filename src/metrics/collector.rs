//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the rally-point matchmaking
//! service using Prometheus metrics.

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Tick engine metrics
    engine_metrics: EngineMetrics,

    /// Session channel metrics
    channel_metrics: ChannelMetrics,

    /// Service-level metrics
    service_metrics: ServiceMetrics,
}

/// Tick engine metrics
#[derive(Clone)]
pub struct EngineMetrics {
    /// Parties currently waiting in the queue store
    pub queued_parties: IntGauge,

    /// Total matches formed
    pub matches_formed_total: IntCounter,

    /// Quality score distribution of emitted matches
    pub match_quality: Histogram,

    /// Wall time of each tick
    pub tick_duration_seconds: Histogram,

    /// Queue entries retired with a timeout outcome
    pub queue_timeouts_total: IntCounter,
}

/// Session channel metrics
#[derive(Clone)]
pub struct ChannelMetrics {
    /// Live session channels
    pub active_channels: IntGauge,

    /// Connected clients across all channels
    pub connected_clients: IntGauge,

    /// Frames fanned out to client queues
    pub frames_fanned_out_total: IntCounter,

    /// Clients dropped, labeled by reason
    pub clients_dropped_total: IntCounterVec,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Broker messages published, labeled by subject
    pub broker_messages_total: IntCounterVec,

    /// Broker publish failures after retry exhaustion
    pub broker_errors_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let engine_metrics = EngineMetrics::new(&registry)?;
        let channel_metrics = ChannelMetrics::new(&registry)?;
        let service_metrics = ServiceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            engine_metrics,
            channel_metrics,
            service_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> &EngineMetrics {
        &self.engine_metrics
    }

    pub fn channel(&self) -> &ChannelMetrics {
        &self.channel_metrics
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Update the overall health gauge (0=unhealthy, 1=degraded, 2=healthy)
    pub fn update_health_status(&self, status: i64) {
        self.service_metrics.health_status.set(status);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("metrics collector with a fresh registry")
    }
}

impl EngineMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let queued_parties = IntGauge::with_opts(Opts::new(
            "queued_parties",
            "Parties currently waiting in the queue store",
        ))?;
        registry.register(Box::new(queued_parties.clone()))?;

        let matches_formed_total = IntCounter::with_opts(Opts::new(
            "matches_formed_total",
            "Total matches formed since service start",
        ))?;
        registry.register(Box::new(matches_formed_total.clone()))?;

        let match_quality = Histogram::with_opts(
            HistogramOpts::new("match_quality", "Quality score of emitted matches")
                .buckets(vec![0.5, 0.6, 0.7, 0.8, 0.9, 0.95, 1.0]),
        )?;
        registry.register(Box::new(match_quality.clone()))?;

        let tick_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Wall time of each matchmaking tick")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.2]),
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        let queue_timeouts_total = IntCounter::with_opts(Opts::new(
            "queue_timeouts_total",
            "Queue entries retired with a timeout outcome",
        ))?;
        registry.register(Box::new(queue_timeouts_total.clone()))?;

        Ok(Self {
            queued_parties,
            matches_formed_total,
            match_quality,
            tick_duration_seconds,
            queue_timeouts_total,
        })
    }
}

impl ChannelMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let active_channels = IntGauge::with_opts(Opts::new(
            "active_channels",
            "Live session channels",
        ))?;
        registry.register(Box::new(active_channels.clone()))?;

        let connected_clients = IntGauge::with_opts(Opts::new(
            "connected_clients",
            "Connected clients across all session channels",
        ))?;
        registry.register(Box::new(connected_clients.clone()))?;

        let frames_fanned_out_total = IntCounter::with_opts(Opts::new(
            "frames_fanned_out_total",
            "Frames enqueued onto client outbound queues",
        ))?;
        registry.register(Box::new(frames_fanned_out_total.clone()))?;

        let clients_dropped_total = IntCounterVec::new(
            Opts::new("clients_dropped_total", "Clients dropped from channels"),
            &["reason"],
        )?;
        registry.register(Box::new(clients_dropped_total.clone()))?;

        Ok(Self {
            active_channels,
            connected_clients,
            frames_fanned_out_total,
            clients_dropped_total,
        })
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::with_opts(Opts::new(
            "uptime_seconds",
            "Service uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::with_opts(Opts::new(
            "health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        ))?;
        registry.register(Box::new(health_status.clone()))?;

        let broker_messages_total = IntCounterVec::new(
            Opts::new("broker_messages_total", "Broker messages published"),
            &["subject"],
        )?;
        registry.register(Box::new(broker_messages_total.clone()))?;

        let broker_errors_total = IntCounter::with_opts(Opts::new(
            "broker_errors_total",
            "Broker publish failures after retry exhaustion",
        ))?;
        registry.register(Box::new(broker_errors_total.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            broker_messages_total,
            broker_errors_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_registers_all_families() {
        let collector = MetricsCollector::new().unwrap();
        collector.engine().matches_formed_total.inc();
        collector.channel().active_channels.set(3);
        collector.update_health_status(2);

        let families = collector.registry().gather();
        let names: Vec<String> = families.iter().map(|f| f.get_name().to_string()).collect();

        assert!(names.iter().any(|n| n == "matches_formed_total"));
        assert!(names.iter().any(|n| n == "active_channels"));
        assert!(names.iter().any(|n| n == "health_status"));
    }

    #[test]
    fn test_dropped_clients_labeled_by_reason() {
        let collector = MetricsCollector::new().unwrap();
        collector
            .channel()
            .clients_dropped_total
            .with_label_values(&["backpressure"])
            .inc();
        collector
            .channel()
            .clients_dropped_total
            .with_label_values(&["idle"])
            .inc();

        let families = collector.registry().gather();
        let dropped = families
            .iter()
            .find(|f| f.get_name() == "clients_dropped_total")
            .unwrap();
        assert_eq!(dropped.get_metric().len(), 2);
    }
}
