//! Main application state and service coordination
//!
//! This module contains the production AppState that coordinates the tick
//! worker, party registry, session channels, broker gossip, and background
//! tasks.

use crate::adapters::broker::{
    AmqpBroker, BrokerConfig, BrokerMessageHandler, MessageBroker, MockBroker,
};
use crate::adapters::identity::JwtIdentityVerifier;
use crate::adapters::snapshot::FileSnapshotStore;
use crate::channel::manager::SessionChannelManager;
use crate::channel::ws;
use crate::config::AppConfig;
use crate::engine::worker::{spawn_engine, EngineHandle, TickOutcome};
use crate::events::bus::EventBus;
use crate::events::publisher::{
    BrokerEventPublisher, QUEUE_DEQUEUE_SUBJECT, QUEUE_ENQUEUE_SUBJECT,
};
use crate::metrics::health::{HealthServer, HealthServerConfig};
use crate::metrics::MetricsCollector;
use crate::party::machine::PartyRegistry;
use crate::service::health::HealthReport;
use crate::types::{PartyId, QueueEntry};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Broker connection error: {message}")]
    BrokerConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Applies queue gossip from sibling engine instances to the local store.
///
/// Self-echoed messages are harmless: a re-delivered enqueue hits the
/// conflict check, a re-delivered dequeue is idempotent.
struct QueueGossipHandler {
    engine: EngineHandle,
}

#[derive(Debug, Deserialize)]
struct DequeueGossip {
    party_id: PartyId,
}

#[async_trait]
impl BrokerMessageHandler for QueueGossipHandler {
    async fn handle(&self, subject: &str, payload: &[u8]) {
        match subject {
            QUEUE_ENQUEUE_SUBJECT => {
                let entry: QueueEntry = match serde_json::from_slice(payload) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Undecodable gossip on {}: {}", subject, e);
                        return;
                    }
                };
                let party_id = entry.party_id;
                match self.engine.enqueue(entry).await {
                    Ok(()) => debug!("Applied gossiped enqueue for party {}", party_id),
                    Err(e) => debug!("Skipped gossiped enqueue for party {}: {}", party_id, e),
                }
            }
            QUEUE_DEQUEUE_SUBJECT => {
                let gossip: DequeueGossip = match serde_json::from_slice(payload) {
                    Ok(gossip) => gossip,
                    Err(e) => {
                        warn!("Undecodable gossip on {}: {}", subject, e);
                        return;
                    }
                };
                match self.engine.dequeue(gossip.party_id).await {
                    Ok(true) => debug!("Applied gossiped dequeue for party {}", gossip.party_id),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to apply gossiped dequeue: {}", e),
                }
            }
            other => debug!("Ignoring gossip on unexpected subject {}", other),
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Party state machine and registry
    registry: Arc<PartyRegistry>,

    /// Handle to the tick worker
    engine: EngineHandle,

    /// Tick worker join handle
    engine_join: Option<JoinHandle<()>>,

    /// Tick outcomes pending dispatch (consumed by `start`)
    outcome_rx: Option<mpsc::UnboundedReceiver<TickOutcome>>,

    /// Session channel fan-out
    channel_manager: Arc<SessionChannelManager>,

    /// Message broker adapter
    broker: Arc<dyn MessageBroker>,

    /// Metrics collector
    metrics: Arc<MetricsCollector>,

    /// Health and metrics endpoints
    health_server: Arc<HealthServer>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    /// Broadcast used to stop the streaming and health servers
    shutdown_tx: broadcast::Sender<()>,

    /// Service status
    is_running: Arc<RwLock<bool>>,

    started_at: Instant,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing rally-point matchmaking service");
        info!(
            "Configuration: service={}, broker={}, gossip={}",
            config.service.name, config.broker.url, config.broker.enable_gossip
        );

        let metrics = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let broker = Self::initialize_broker(&config).await?;
        let publisher = Arc::new(BrokerEventPublisher::new(broker.clone(), metrics.clone()));

        let bus = Arc::new(EventBus::with_external(
            config.channel.bus_capacity,
            publisher.clone(),
        ));

        let (engine, outcome_rx, engine_join) = spawn_engine(config.engine.clone(), metrics.clone());

        let snapshots = Arc::new(FileSnapshotStore::new(&config.snapshot.data_dir));
        let registry = Arc::new(PartyRegistry::new(
            bus.clone(),
            engine.clone(),
            snapshots,
            publisher,
        ));

        let identity = Arc::new(JwtIdentityVerifier::new(&config.service.token_secret));
        let channel_manager = Arc::new(SessionChannelManager::new(
            bus,
            identity,
            registry.clone(),
            metrics.clone(),
            config.channel.clone(),
        ));

        let health_server = Arc::new(HealthServer::new(
            HealthServerConfig {
                port: config.service.metrics_port,
                host: "0.0.0.0".to_string(),
            },
            metrics.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            registry,
            engine,
            engine_join: Some(engine_join),
            outcome_rx: Some(outcome_rx),
            channel_manager,
            broker,
            metrics,
            health_server,
            background_tasks: Vec::new(),
            shutdown_tx,
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Start all background services
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting rally-point matchmaking service");

        *self.is_running.write().await = true;

        self.start_outcome_dispatcher()?;
        self.start_streaming_surface();
        self.start_health_server();
        self.start_channel_sweeper();
        self.start_health_report_task();
        self.start_gossip_subscription().await?;

        info!("✅ Rally-point matchmaking service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of rally-point service");

        *self.is_running.write().await = false;

        // Drain the mailbox and run a final tick before refusing new commands
        if let Err(e) = self.engine.shutdown().await {
            warn!("Tick worker did not shut down cleanly: {}", e);
        }
        if let Some(join) = self.engine_join.take() {
            if let Err(e) = join.await {
                warn!("Tick worker task failed: {}", e);
            }
        }

        // Stop the streaming and health servers
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.health_server.stop().await {
            warn!("Failed to stop health server: {}", e);
        }

        self.stop_background_tasks().await;

        info!("✅ Rally-point service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn registry(&self) -> Arc<PartyRegistry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine.clone()
    }

    pub fn channel_manager(&self) -> Arc<SessionChannelManager> {
        self.channel_manager.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Connect the broker adapter, or fall back to the in-process mock for
    /// single-instance deployments.
    async fn initialize_broker(
        config: &AppConfig,
    ) -> Result<Arc<dyn MessageBroker>, ServiceError> {
        if !config.broker.enable_gossip {
            info!("Gossip disabled; using in-process mock broker");
            return Ok(Arc::new(MockBroker::new()));
        }

        info!("Connecting to message broker: {}", config.broker.url);
        let broker_config = BrokerConfig {
            max_retries: config.broker.max_retry_attempts,
            retry_delay_ms: config.broker.retry_delay_ms,
            operation_timeout_ms: config.broker.connection_timeout_seconds * 1000,
            ..BrokerConfig::from_url(&config.broker.url, &config.broker.exchange_name)
        };

        match AmqpBroker::connect(broker_config).await {
            Ok(broker) => Ok(Arc::new(broker)),
            Err(e) => {
                // Loss of broker connectivity demotes cross-instance gossip,
                // it does not take down single-instance matching
                warn!(
                    "Broker unavailable ({}); continuing with single-instance matching",
                    e
                );
                Ok(Arc::new(MockBroker::new()))
            }
        }
    }

    /// Route tick outcomes into the party state machine
    fn start_outcome_dispatcher(&mut self) -> Result<(), ServiceError> {
        let mut outcome_rx =
            self.outcome_rx
                .take()
                .ok_or_else(|| ServiceError::Initialization {
                    message: "outcome dispatcher already started".to_string(),
                })?;
        let registry = self.registry.clone();

        let task = tokio::spawn(async move {
            info!("Tick outcome dispatcher started");
            while let Some(outcome) = outcome_rx.recv().await {
                match outcome {
                    TickOutcome::MatchFormed(found) => registry.apply_match(&found).await,
                    TickOutcome::QueueTimeout(entry) => {
                        registry.handle_queue_timeout(&entry).await
                    }
                }
            }
            info!("Tick outcome dispatcher stopped");
        });

        self.background_tasks.push(task);
        Ok(())
    }

    fn start_streaming_surface(&mut self) {
        let manager = self.channel_manager.clone();
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.service.ws_port).into();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            if let Err(e) = ws::serve(manager, addr, shutdown_rx).await {
                error!("Streaming surface failed: {}", e);
            }
        });
        self.background_tasks.push(task);
    }

    fn start_health_server(&mut self) {
        let health_server = self.health_server.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = health_server.start().await {
                error!("Health server failed: {}", e);
            }
        });
        self.background_tasks.push(task);
    }

    fn start_channel_sweeper(&mut self) {
        let sweeper = self
            .channel_manager
            .clone()
            .spawn_sweeper(self.config.sweep_interval());
        self.background_tasks.push(sweeper);
    }

    /// Periodically gather a health report for the /health endpoint
    fn start_health_report_task(&mut self) {
        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let slot = self.health_server.report_slot();
        let service_name = self.config.service.name.clone();
        let is_running = self.is_running.clone();
        let started_at = self.started_at;

        let task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            info!("Health report task started");

            while *is_running.read().await {
                ticker.tick().await;

                let uptime = started_at.elapsed().as_secs();
                metrics.service().uptime_seconds.set(uptime as i64);

                let report =
                    HealthReport::gather(&service_name, &engine, &metrics, uptime).await;
                debug!(
                    "Health report: {} - {} queued, {} matches",
                    report.status, report.stats.queued_parties, report.stats.matches_formed
                );
                *slot.write().await = Some(report);
            }

            info!("Health report task stopped");
        });
        self.background_tasks.push(task);
    }

    /// Subscribe to sibling instances' queue gossip
    async fn start_gossip_subscription(&self) -> Result<(), ServiceError> {
        if !self.config.broker.enable_gossip {
            return Ok(());
        }

        let handler = Arc::new(QueueGossipHandler {
            engine: self.engine.clone(),
        });

        self.broker
            .subscribe("matchmaker.queue.*", handler)
            .await
            .map_err(|e| ServiceError::BrokerConnection {
                message: format!("Failed to subscribe to queue gossip: {}", e),
            })?;

        info!("Subscribed to cross-instance queue gossip");
        Ok(())
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }

        // Give tasks time to observe the abort
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("✅ All {} background tasks stopped", task_count);
    }
}
