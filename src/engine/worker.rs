//! Dedicated tick worker with a bounded command mailbox
//!
//! The worker task is the single writer of the queue store: enqueues and
//! dequeues arrive as commands, the tick fires on a fixed interval, and tick
//! outcomes (matches, timeouts) stream out to whoever wired the engine up.

use crate::config::EngineSettings;
use crate::engine::tick::TickEngine;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{Match, PartyId, QueueEntry};
use crate::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Commands accepted by the tick worker
#[derive(Debug)]
pub enum EngineCommand {
    Enqueue {
        entry: QueueEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    Dequeue {
        party_id: PartyId,
        reply: oneshot::Sender<bool>,
    },
    IsQueued {
        party_id: PartyId,
        reply: oneshot::Sender<bool>,
    },
    Sizes {
        reply: oneshot::Sender<HashMap<String, usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What a tick produced, streamed to the outcome dispatcher
#[derive(Debug)]
pub enum TickOutcome {
    MatchFormed(Match),
    QueueTimeout(QueueEntry),
}

/// Clonable handle for talking to the tick worker
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Hand an entry to the queue store. Fails with `conflict` when the
    /// party is already queued, or `transport` when the worker is gone.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Enqueue { entry, reply }).await?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Remove a party from the queue. Returns whether it was present.
    pub async fn dequeue(&self, party_id: PartyId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Dequeue { party_id, reply }).await?;
        rx.await.map_err(|_| worker_gone().into())
    }

    pub async fn is_queued(&self, party_id: PartyId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::IsQueued { party_id, reply }).await?;
        rx.await.map_err(|_| worker_gone().into())
    }

    /// Per-bucket queue sizes for telemetry
    pub async fn sizes(&self) -> Result<HashMap<String, usize>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Sizes { reply }).await?;
        rx.await.map_err(|_| worker_gone().into())
    }

    /// Drain the mailbox, run a final tick, and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| worker_gone().into())
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| worker_gone().into())
    }
}

fn worker_gone() -> MatchmakingError {
    MatchmakingError::Transport {
        message: "tick worker is not running".to_string(),
    }
}

/// Spawn the tick worker. Returns the command handle, the stream of tick
/// outcomes, and the worker's join handle.
pub fn spawn_engine(
    config: EngineSettings,
    metrics: Arc<MetricsCollector>,
) -> (
    EngineHandle,
    mpsc::UnboundedReceiver<TickOutcome>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    let worker = EngineWorker {
        engine: TickEngine::new(config.clone()),
        mailbox: rx,
        outcomes: outcome_tx,
        metrics,
        tick_interval: Duration::from_millis(config.tick_interval_ms),
    };

    let join = tokio::spawn(worker.run());
    (EngineHandle { tx }, outcome_rx, join)
}

struct EngineWorker {
    engine: TickEngine,
    mailbox: mpsc::Receiver<EngineCommand>,
    outcomes: mpsc::UnboundedSender<TickOutcome>,
    metrics: Arc<MetricsCollector>,
    tick_interval: Duration,
}

impl EngineWorker {
    async fn run(mut self) {
        info!(
            "Tick worker started - interval: {}ms",
            self.tick_interval.as_millis()
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_stats = Instant::now();
        let mut total_matches: u64 = 0;

        loop {
            tokio::select! {
                maybe_command = self.mailbox.recv() => {
                    match maybe_command {
                        Some(EngineCommand::Shutdown { reply }) => {
                            self.drain_mailbox();
                            total_matches += self.run_tick();
                            info!(
                                "Tick worker shutting down after final tick - total_matches: {}",
                                total_matches
                            );
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            info!("All engine handles dropped, tick worker stopping");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    total_matches += self.run_tick();

                    if last_stats.elapsed() >= Duration::from_secs(10) {
                        let sizes = self.engine.sizes_by_bucket();
                        info!(
                            "Engine stats: total_queued={}, total_matches={}, buckets={}",
                            self.engine.queue_size(),
                            total_matches,
                            sizes.len()
                        );
                        for (bucket, size) in sizes {
                            debug!("  Bucket {}: {} parties", bucket, size);
                        }
                        last_stats = Instant::now();
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Enqueue { entry, reply } => {
                let result = self.engine.enqueue(entry);
                self.metrics
                    .engine()
                    .queued_parties
                    .set(self.engine.queue_size() as i64);
                let _ = reply.send(result);
            }
            EngineCommand::Dequeue { party_id, reply } => {
                let removed = self.engine.dequeue(&party_id);
                self.metrics
                    .engine()
                    .queued_parties
                    .set(self.engine.queue_size() as i64);
                let _ = reply.send(removed);
            }
            EngineCommand::IsQueued { party_id, reply } => {
                let _ = reply.send(self.engine.is_queued(&party_id));
            }
            EngineCommand::Sizes { reply } => {
                let _ = reply.send(self.engine.sizes_by_bucket());
            }
            EngineCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    /// Run one tick and dispatch its outcomes. Returns the match count.
    fn run_tick(&mut self) -> u64 {
        let started = Instant::now();
        let report = self.engine.tick(current_timestamp());
        self.metrics
            .engine()
            .tick_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .engine()
            .queued_parties
            .set(self.engine.queue_size() as i64);

        let matches = report.matches.len() as u64;

        for entry in report.timeouts {
            self.metrics.engine().queue_timeouts_total.inc();
            warn!(
                "Queue entry timed out - party: {}, waited past bound",
                entry.party_id
            );
            if self.outcomes.send(TickOutcome::QueueTimeout(entry)).is_err() {
                debug!("No outcome consumer attached, dropping timeout notification");
            }
        }

        for formed in report.matches {
            self.metrics.engine().matches_formed_total.inc();
            self.metrics
                .engine()
                .match_quality
                .observe(formed.quality_score);
            info!(
                "Match formed: id={}, region={}, mode={}, mmr={}, quality={:.2}",
                formed.match_id, formed.region, formed.mode, formed.avg_mmr, formed.quality_score
            );
            if self.outcomes.send(TickOutcome::MatchFormed(formed)).is_err() {
                debug!("No outcome consumer attached, dropping match notification");
            }
        }

        matches
    }

    /// Consume every command already in the mailbox (used before the final
    /// shutdown tick).
    fn drain_mailbox(&mut self) {
        while let Ok(command) = self.mailbox.try_recv() {
            match command {
                EngineCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                other => self.handle_command(other),
            }
        }
    }
}
