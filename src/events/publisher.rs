//! External event publisher for cross-instance delivery
//!
//! Queue transitions and formed matches are published to well-known broker
//! subjects so sibling engine instances (and downstream consumers like the
//! session allocator) observe them.

use crate::adapters::broker::MessageBroker;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{Match, PartyId, QueueEntry, QueueLeaveReason};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Broker subjects for matchmaking gossip
pub const QUEUE_ENQUEUE_SUBJECT: &str = "matchmaker.queue.enqueue";
pub const QUEUE_DEQUEUE_SUBJECT: &str = "matchmaker.queue.dequeue";
pub const MATCH_FOUND_SUBJECT: &str = "matchmaker.match.found";

/// Trait for publishing matchmaking events beyond this process
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a queue entry the moment a party enters the queue
    async fn publish_queue_enqueued(&self, entry: &QueueEntry) -> Result<()>;

    /// Publish a queue departure (cancel, underpopulation, or timeout)
    async fn publish_queue_dequeued(&self, party_id: PartyId, reason: QueueLeaveReason)
        -> Result<()>;

    /// Publish a formed match
    async fn publish_match_found(&self, found: &Match) -> Result<()>;
}

/// Broker-backed publisher implementation
pub struct BrokerEventPublisher {
    broker: Arc<dyn MessageBroker>,
    metrics: Arc<MetricsCollector>,
}

impl BrokerEventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, metrics: Arc<MetricsCollector>) -> Self {
        Self { broker, metrics }
    }

    async fn publish_json(&self, subject: &str, payload: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(payload).map_err(|e| MatchmakingError::Internal {
            message: format!("failed to encode {} payload: {}", subject, e),
        })?;

        match self.broker.publish(subject, &bytes).await {
            Ok(()) => {
                self.metrics
                    .service()
                    .broker_messages_total
                    .with_label_values(&[subject])
                    .inc();
                debug!("Published event to {}", subject);
                Ok(())
            }
            Err(e) => {
                self.metrics.service().broker_errors_total.inc();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerEventPublisher {
    async fn publish_queue_enqueued(&self, entry: &QueueEntry) -> Result<()> {
        let payload = serde_json::to_value(entry).map_err(|e| MatchmakingError::Internal {
            message: format!("failed to encode queue entry: {}", e),
        })?;
        self.publish_json(QUEUE_ENQUEUE_SUBJECT, &payload).await
    }

    async fn publish_queue_dequeued(
        &self,
        party_id: PartyId,
        reason: QueueLeaveReason,
    ) -> Result<()> {
        let payload = json!({
            "party_id": party_id,
            "reason": reason,
        });
        self.publish_json(QUEUE_DEQUEUE_SUBJECT, &payload).await
    }

    async fn publish_match_found(&self, found: &Match) -> Result<()> {
        let payload = serde_json::to_value(found).map_err(|e| MatchmakingError::Internal {
            message: format!("failed to encode match: {}", e),
        })?;
        self.publish_json(MATCH_FOUND_SUBJECT, &payload).await
    }
}

/// Mock event publisher for testing
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: std::sync::Mutex<Vec<String>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published event types (for testing)
    pub fn get_published_events(&self) -> Vec<String> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Count events of a given type (for testing)
    pub fn count_events_of_type(&self, event_type: &str) -> usize {
        self.get_published_events()
            .iter()
            .filter(|e| *e == event_type)
            .count()
    }

    fn record(&self, event_type: &str) {
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event_type.to_string());
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_queue_enqueued(&self, _entry: &QueueEntry) -> Result<()> {
        self.record("queue_enqueued");
        Ok(())
    }

    async fn publish_queue_dequeued(
        &self,
        _party_id: PartyId,
        _reason: QueueLeaveReason,
    ) -> Result<()> {
        self.record("queue_dequeued");
        Ok(())
    }

    async fn publish_match_found(&self, _found: &Match) -> Result<()> {
        self.record("match_found");
        Ok(())
    }
}
