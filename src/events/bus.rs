//! Process-internal publish/subscribe keyed by party id
//!
//! Every subscription is a bounded channel carrying `Frame`s with per-party
//! monotonic sequence numbers. Delivery is best-effort and in publication
//! order; a full subscriber loses the frame rather than blocking the
//! publisher. Queue transitions are additionally forwarded to the external
//! publisher so sibling instances observe them.

use crate::events::publisher::EventPublisher;
use crate::types::{Frame, PartyEvent, PartyId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A live subscription to one party's events
pub struct Subscription {
    pub party_id: PartyId,
    id: u64,
    rx: mpsc::Receiver<Frame>,
}

impl Subscription {
    /// Receive the next frame; `None` once the subscription is removed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct PartyTopic {
    seq: u64,
    subscribers: Vec<(u64, mpsc::Sender<Frame>)>,
}

/// The in-process event bus
pub struct EventBus {
    topics: Mutex<HashMap<PartyId, PartyTopic>>,
    external: Option<Arc<dyn EventPublisher>>,
    capacity: usize,
    next_subscription_id: AtomicU64,
}

impl EventBus {
    /// Bus with local delivery only
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            external: None,
            capacity,
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Bus that also forwards queue transitions to an external publisher
    pub fn with_external(capacity: usize, external: Arc<dyn EventPublisher>) -> Self {
        Self {
            external: Some(external),
            ..Self::new(capacity)
        }
    }

    /// Publish an event to every subscriber of `party_id`, in order.
    pub async fn publish(&self, party_id: PartyId, event: PartyEvent) {
        {
            let mut topics = self.topics.lock().expect("bus lock poisoned");
            let topic = topics.entry(party_id).or_default();
            topic.seq += 1;
            let frame = Frame {
                event: event.clone(),
                seq: topic.seq,
            };

            topic.subscribers.retain(|(id, tx)| {
                match tx.try_send(frame.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Lossy by contract; the channel manager enforces its
                        // own backpressure policy on client queues
                        debug!(
                            "Subscription {} for party {} is full, dropping {}",
                            id,
                            party_id,
                            frame.event.tag()
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }

        // Gossip queue transitions; match events are published at the source
        // by the tick outcome dispatcher, once per match rather than per party
        if let Some(external) = &self.external {
            let forwarded = match &event {
                PartyEvent::QueueEntered { entry } => {
                    Some(external.publish_queue_enqueued(entry).await)
                }
                PartyEvent::QueueLeft { party_id, reason } => {
                    Some(external.publish_queue_dequeued(*party_id, *reason).await)
                }
                _ => None,
            };

            if let Some(Err(e)) = forwarded {
                warn!(
                    "Failed to forward {} for party {} to broker: {}",
                    event.tag(),
                    party_id,
                    e
                );
            }
        }
    }

    /// Open a bounded subscription to one party's events.
    pub fn subscribe(&self, party_id: PartyId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.lock().expect("bus lock poisoned");
        topics.entry(party_id).or_default().subscribers.push((id, tx));

        Subscription { party_id, id, rx }
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, party_id: PartyId, subscription_id: u64) {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        if let Some(topic) = topics.get_mut(&party_id) {
            topic.subscribers.retain(|(id, _)| *id != subscription_id);
        }
    }

    pub fn subscriber_count(&self, party_id: PartyId) -> usize {
        let topics = self.topics.lock().expect("bus lock poisoned");
        topics
            .get(&party_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::publisher::MockEventPublisher;
    use crate::types::QueueLeaveReason;
    use crate::utils::{current_timestamp, generate_party_id};

    fn member_event(party_id: PartyId, player: &str) -> PartyEvent {
        PartyEvent::MemberJoined {
            party_id,
            player_id: player.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_with_sequence() {
        let bus = EventBus::new(64);
        let party_id = generate_party_id();
        let mut sub = bus.subscribe(party_id);

        for i in 0..5 {
            bus.publish(party_id, member_event(party_id, &format!("p{i}"))).await;
        }

        for expected_seq in 1..=5 {
            let frame = sub.recv().await.unwrap();
            assert_eq!(frame.seq, expected_seq);
        }
    }

    #[tokio::test]
    async fn test_no_cross_party_delivery() {
        let bus = EventBus::new(64);
        let party_a = generate_party_id();
        let party_b = generate_party_id();
        let mut sub_a = bus.subscribe(party_a);

        bus.publish(party_b, member_event(party_b, "p1")).await;
        bus.publish(party_a, member_event(party_a, "p2")).await;

        let frame = sub_a.recv().await.unwrap();
        match frame.event {
            PartyEvent::MemberJoined { player_id, .. } => assert_eq!(player_id, "p2"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new(64);
        let party_id = generate_party_id();
        let sub = bus.subscribe(party_id);
        let sub_id = sub.id();

        assert_eq!(bus.subscriber_count(party_id), 1);
        bus.unsubscribe(party_id, sub_id);
        bus.unsubscribe(party_id, sub_id);
        assert_eq!(bus.subscriber_count(party_id), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_loses_frames_but_stays() {
        let bus = EventBus::new(2);
        let party_id = generate_party_id();
        let mut sub = bus.subscribe(party_id);

        for i in 0..5 {
            bus.publish(party_id, member_event(party_id, &format!("p{i}"))).await;
        }

        // Only the first two fit; the subscription survives
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert_eq!(bus.subscriber_count(party_id), 1);
    }

    #[tokio::test]
    async fn test_queue_events_forwarded_externally() {
        let external = Arc::new(MockEventPublisher::new());
        let bus = EventBus::with_external(64, external.clone());
        let party_id = generate_party_id();

        let entry = crate::types::QueueEntry {
            party_id,
            region: "us-west".to_string(),
            mode: "ranked".to_string(),
            team_size: 5,
            party_size: 1,
            avg_mmr: 1500,
            enqueued_at: current_timestamp(),
            player_ids: vec!["p0".to_string()],
        };

        bus.publish(party_id, PartyEvent::QueueEntered { entry }).await;
        bus.publish(
            party_id,
            PartyEvent::QueueLeft {
                party_id,
                reason: QueueLeaveReason::Cancelled,
            },
        )
        .await;
        bus.publish(party_id, member_event(party_id, "p1")).await;

        assert_eq!(external.count_events_of_type("queue_enqueued"), 1);
        assert_eq!(external.count_events_of_type("queue_dequeued"), 1);
        // Membership events stay local
        assert_eq!(external.get_published_events().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new(64);
        let party_id = generate_party_id();
        let sub = bus.subscribe(party_id);
        drop(sub);

        bus.publish(party_id, member_event(party_id, "p1")).await;
        assert_eq!(bus.subscriber_count(party_id), 0);
    }
}
