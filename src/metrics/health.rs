//! Health check endpoints and Prometheus metrics server
//!
//! This module provides HTTP endpoints for health checks and Prometheus
//! metrics for the rally-point matchmaking service using Axum.

use crate::metrics::collector::MetricsCollector;
use crate::service::health::HealthReport;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

/// Health server configuration
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    /// Port to bind the health server to
    pub port: u16,
    /// Host to bind to (typically "0.0.0.0" for all interfaces)
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state for the health server
#[derive(Clone)]
struct HealthServerState {
    collector: Arc<MetricsCollector>,
    report: Arc<RwLock<Option<HealthReport>>>,
}

/// Health server that provides HTTP endpoints for monitoring
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    /// Create a new health server
    pub fn new(config: HealthServerConfig, collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: HealthServerState {
                collector,
                report: Arc::new(RwLock::new(None)),
            },
            shutdown_tx,
        }
    }

    /// Shared slot the service's health task writes fresh reports into
    pub fn report_slot(&self) -> Arc<RwLock<Option<HealthReport>>> {
        self.state.report.clone()
    }

    /// Start the health server
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr).await?;

        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        Ok(())
    }

    /// Stop the health server
    pub async fn stop(&self) -> Result<()> {
        if self.shutdown_tx.send(()).is_err() {
            error!("Health server was not running");
        }
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/live", get(live_handler))
            .route("/ready", get(ready_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }
}

/// Liveness probe: the process answers
async fn live_handler() -> &'static str {
    "OK"
}

/// Readiness probe: a health report has been gathered at least once
async fn ready_handler(State(state): State<HealthServerState>) -> Response {
    if state.report.read().await.is_some() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}

/// Full health report as JSON
async fn health_handler(State(state): State<HealthServerState>) -> Response {
    match state.report.read().await.clone() {
        Some(report) => {
            let code = match report.status {
                crate::service::health::HealthStatus::Unhealthy => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::OK,
            };
            (code, Json(report)).into_response()
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "no report yet").into_response(),
    }
}

/// Prometheus exposition format
async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    let encoder = TextEncoder::new();
    let families = state.collector.registry().gather();
    let mut buffer = Vec::new();

    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response()
        }
    }
}
