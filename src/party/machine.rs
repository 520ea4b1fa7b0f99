//! Party state machine
//!
//! Owns every party record and enforces the lifecycle
//! `idle -> queueing -> matched -> ended`. Each transition publishes exactly
//! one event onto the bus under the party's id and writes a durable snapshot.
//! Queue transitions hand entries to (or pull them from) the tick worker.

use crate::adapters::snapshot::PartySnapshotStore;
use crate::engine::worker::EngineHandle;
use crate::error::{MatchmakingError, Result};
use crate::events::bus::EventBus;
use crate::events::publisher::EventPublisher;
use crate::types::{
    Match, MatchId, Party, PartyEvent, PartyId, PartyMember, PartyStatus, PlayerId, QueueEntry,
    QueueLeaveReason,
};
use crate::utils::{current_timestamp, generate_party_id};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    parties: HashMap<PartyId, Party>,
    /// At most one party membership per player
    player_index: HashMap<PlayerId, PartyId>,
}

/// The party state machine and registry
pub struct PartyRegistry {
    state: RwLock<RegistryState>,
    bus: Arc<EventBus>,
    engine: EngineHandle,
    snapshots: Arc<dyn PartySnapshotStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl PartyRegistry {
    pub fn new(
        bus: Arc<EventBus>,
        engine: EngineHandle,
        snapshots: Arc<dyn PartySnapshotStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            bus,
            engine,
            snapshots,
            publisher,
        }
    }

    /// Create a party with the acting player as leader (leader starts ready).
    pub async fn create_party(
        &self,
        leader_id: &str,
        mmr: i32,
        region: &str,
        max_size: usize,
    ) -> Result<Party> {
        if max_size == 0 {
            return Err(MatchmakingError::Conflict {
                reason: "party max size must be at least 1".to_string(),
            }
            .into());
        }

        let party = {
            let mut state = self.lock_write()?;
            if state.player_index.contains_key(leader_id) {
                return Err(MatchmakingError::Conflict {
                    reason: format!("player {} is already in a party", leader_id),
                }
                .into());
            }

            let party = Party {
                id: generate_party_id(),
                region: region.to_string(),
                max_size,
                members: vec![PartyMember {
                    player_id: leader_id.to_string(),
                    mmr,
                    ready: true,
                    joined_at: current_timestamp(),
                }],
                leader_id: leader_id.to_string(),
                status: PartyStatus::Idle,
                created_at: current_timestamp(),
            };

            state.player_index.insert(leader_id.to_string(), party.id);
            state.parties.insert(party.id, party.clone());
            party
        };

        info!("Party {} created by {}", party.id, leader_id);
        self.bus
            .publish(party.id, PartyEvent::PartyUpdated { party: party.clone() })
            .await;
        self.write_snapshot(&party).await;

        Ok(party)
    }

    pub fn get_party(&self, party_id: PartyId) -> Result<Party> {
        let state = self.lock_read()?;
        state
            .parties
            .get(&party_id)
            .cloned()
            .ok_or_else(|| party_not_found(party_id).into())
    }

    pub fn is_member(&self, party_id: PartyId, player_id: &str) -> Result<bool> {
        Ok(self.get_party(party_id)?.is_member(player_id))
    }

    /// Party a player currently belongs to, if any
    pub fn party_for_player(&self, player_id: &str) -> Option<PartyId> {
        self.lock_read().ok()?.player_index.get(player_id).copied()
    }

    /// Join an idle party. Membership mutations are rejected outside `idle`.
    pub async fn join_party(&self, party_id: PartyId, player_id: &str, mmr: i32) -> Result<Party> {
        let party = {
            let mut state = self.lock_write()?;
            if state.player_index.contains_key(player_id) {
                return Err(MatchmakingError::Conflict {
                    reason: format!("player {} is already in a party", player_id),
                }
                .into());
            }

            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;

            if party.status != PartyStatus::Idle {
                return Err(illegal_state("join", party.status).into());
            }
            if party.size() >= party.max_size {
                return Err(MatchmakingError::Conflict {
                    reason: format!("party {} is full", party_id),
                }
                .into());
            }

            party.members.push(PartyMember {
                player_id: player_id.to_string(),
                mmr,
                ready: false,
                joined_at: current_timestamp(),
            });
            let party = party.clone();
            state.player_index.insert(player_id.to_string(), party_id);
            party
        };

        info!("Player {} joined party {}", player_id, party_id);
        self.bus
            .publish(
                party_id,
                PartyEvent::MemberJoined {
                    party_id,
                    player_id: player_id.to_string(),
                },
            )
            .await;
        self.write_snapshot(&party).await;

        Ok(party)
    }

    /// Set a member's ready flag. Only accepted while idle.
    pub async fn set_ready(&self, party_id: PartyId, player_id: &str, ready: bool) -> Result<Party> {
        let party = {
            let mut state = self.lock_write()?;
            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;

            if party.status != PartyStatus::Idle {
                return Err(illegal_state("ready", party.status).into());
            }

            let member = party
                .member_mut(player_id)
                .ok_or_else(|| MatchmakingError::NotFound {
                    kind: "member".to_string(),
                    id: player_id.to_string(),
                })?;
            member.ready = ready;
            party.clone()
        };

        self.bus
            .publish(
                party_id,
                PartyEvent::MemberReady {
                    party_id,
                    player_id: player_id.to_string(),
                    ready,
                },
            )
            .await;
        self.write_snapshot(&party).await;

        Ok(party)
    }

    /// Remove a member. Allowed while idle or queueing; a queueing party
    /// first drops out of the queue with reason `underpopulated`. The leader
    /// leaving (or the last member) disbands the party.
    pub async fn leave_party(&self, party_id: PartyId, player_id: &str) -> Result<()> {
        // Validate and find out whether we must exit the queue first
        let was_queueing = {
            let state = self.lock_read()?;
            let party = state
                .parties
                .get(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;
            if !party.is_member(player_id) {
                return Err(MatchmakingError::NotFound {
                    kind: "member".to_string(),
                    id: player_id.to_string(),
                }
                .into());
            }
            match party.status {
                PartyStatus::Idle | PartyStatus::Queueing => {}
                status => return Err(illegal_state("leave", status).into()),
            }
            party.status == PartyStatus::Queueing
        };

        if was_queueing {
            self.exit_queue(party_id, QueueLeaveReason::Underpopulated)
                .await?;
        }

        // Remove the member
        let (party, disbanded) = {
            let mut state = self.lock_write()?;
            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;

            party.members.retain(|m| m.player_id != player_id);
            let disbanded = player_id == party.leader_id || party.members.is_empty();
            if disbanded {
                party.status = PartyStatus::Ended;
            }
            let party = party.clone();
            state.player_index.remove(player_id);
            if disbanded {
                for member in &party.members {
                    state.player_index.remove(&member.player_id);
                }
            }
            (party, disbanded)
        };

        info!("Player {} left party {}", player_id, party_id);
        self.bus
            .publish(
                party_id,
                PartyEvent::MemberLeft {
                    party_id,
                    player_id: player_id.to_string(),
                },
            )
            .await;

        if disbanded {
            info!("Party {} disbanded", party_id);
            self.bus
                .publish(party_id, PartyEvent::PartyUpdated { party: party.clone() })
                .await;
        }
        self.write_snapshot(&party).await;

        Ok(())
    }

    /// Leader requests queue entry. Validates readiness and sizing, hands the
    /// entry to the tick worker, then transitions to `queueing`.
    pub async fn enter_queue(
        &self,
        party_id: PartyId,
        acting_player: &str,
        mode: &str,
        team_size: usize,
    ) -> Result<QueueEntry> {
        let entry = {
            let state = self.lock_read()?;
            let party = state
                .parties
                .get(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;

            if party.leader_id != acting_player {
                return Err(MatchmakingError::Forbidden {
                    player_id: acting_player.to_string(),
                    party_id: party_id.to_string(),
                }
                .into());
            }
            if party.status != PartyStatus::Idle {
                return Err(illegal_state("queue", party.status).into());
            }
            if !party.all_ready() {
                return Err(MatchmakingError::IllegalState {
                    operation: "queue".to_string(),
                    status: "awaiting ready members".to_string(),
                }
                .into());
            }
            if team_size < party.size() {
                return Err(MatchmakingError::IllegalState {
                    operation: "queue".to_string(),
                    status: format!("party of {} exceeds team size {}", party.size(), team_size),
                }
                .into());
            }

            QueueEntry {
                party_id,
                region: party.region.clone(),
                mode: mode.to_string(),
                team_size,
                party_size: party.size(),
                avg_mmr: party.avg_mmr(),
                enqueued_at: current_timestamp(),
                player_ids: party.player_ids(),
            }
        };

        self.engine.enqueue(entry.clone()).await?;

        let party = {
            let mut state = self.lock_write()?;
            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;
            party.status = PartyStatus::Queueing;
            party.clone()
        };

        info!(
            "Party {} entered queue - mode: {}, team_size: {}, avg_mmr: {}",
            party_id, entry.mode, entry.team_size, entry.avg_mmr
        );
        self.bus
            .publish(party_id, PartyEvent::QueueEntered { entry: entry.clone() })
            .await;
        self.write_snapshot(&party).await;

        Ok(entry)
    }

    /// Leader cancels the queue entry.
    pub async fn leave_queue(&self, party_id: PartyId, acting_player: &str) -> Result<()> {
        {
            let state = self.lock_read()?;
            let party = state
                .parties
                .get(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;
            if party.leader_id != acting_player {
                return Err(MatchmakingError::Forbidden {
                    player_id: acting_player.to_string(),
                    party_id: party_id.to_string(),
                }
                .into());
            }
            if party.status != PartyStatus::Queueing {
                return Err(illegal_state("unqueue", party.status).into());
            }
        }

        self.exit_queue(party_id, QueueLeaveReason::Cancelled).await
    }

    /// Timeout notification from the tick worker; the entry is already gone
    /// from the queue store.
    pub async fn handle_queue_timeout(&self, entry: &QueueEntry) {
        let party = {
            let Ok(mut state) = self.state.write() else {
                return;
            };
            let Some(party) = state.parties.get_mut(&entry.party_id) else {
                debug!("Timeout for unknown party {}", entry.party_id);
                return;
            };
            if party.status != PartyStatus::Queueing {
                debug!(
                    "Timeout for party {} ignored in status {}",
                    entry.party_id, party.status
                );
                return;
            }
            party.status = PartyStatus::Idle;
            party.clone()
        };

        info!("Party {} left queue: timeout", entry.party_id);
        self.bus
            .publish(
                entry.party_id,
                PartyEvent::QueueLeft {
                    party_id: entry.party_id,
                    reason: QueueLeaveReason::Timeout,
                },
            )
            .await;
        self.write_snapshot(&party).await;
    }

    /// Match-found notification from the tick worker. Gossips the match once,
    /// then transitions each constituent party.
    pub async fn apply_match(&self, found: &Match) {
        if let Err(e) = self.publisher.publish_match_found(found).await {
            warn!(
                "Failed to publish match {} to broker: {}",
                found.match_id, e
            );
        }

        for &party_id in &found.party_ids {
            let party = {
                let Ok(mut state) = self.state.write() else {
                    return;
                };
                let Some(party) = state.parties.get_mut(&party_id) else {
                    // A gossiped entry from a sibling instance; not ours to track
                    debug!("Match {} references unknown party {}", found.match_id, party_id);
                    continue;
                };
                if party.status != PartyStatus::Queueing {
                    warn!(
                        "Match {} hit party {} in status {}",
                        found.match_id, party_id, party.status
                    );
                    continue;
                }
                party.status = PartyStatus::Matched;
                party.clone()
            };

            info!("Party {} matched into {}", party_id, found.match_id);
            self.bus
                .publish(
                    party_id,
                    PartyEvent::MatchFound {
                        party_id,
                        found: found.clone(),
                    },
                )
                .await;
            self.write_snapshot(&party).await;
        }
    }

    /// Downstream session terminated (or never started).
    pub async fn end_session(&self, party_id: PartyId, match_id: MatchId) -> Result<()> {
        let party = {
            let mut state = self.lock_write()?;
            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;
            if party.status != PartyStatus::Matched {
                return Err(illegal_state("end_session", party.status).into());
            }
            party.status = PartyStatus::Ended;
            let party = party.clone();
            for member in &party.members {
                state.player_index.remove(&member.player_id);
            }
            party
        };

        info!("Session {} ended for party {}", match_id, party_id);
        self.bus
            .publish(party_id, PartyEvent::SessionEnded { party_id, match_id })
            .await;
        self.write_snapshot(&party).await;

        Ok(())
    }

    /// Shared `queueing -> idle` transition
    async fn exit_queue(&self, party_id: PartyId, reason: QueueLeaveReason) -> Result<()> {
        self.engine.dequeue(party_id).await?;

        let party = {
            let mut state = self.lock_write()?;
            let party = state
                .parties
                .get_mut(&party_id)
                .ok_or_else(|| party_not_found(party_id))?;
            party.status = PartyStatus::Idle;
            party.clone()
        };

        info!("Party {} left queue: {:?}", party_id, reason);
        self.bus
            .publish(party_id, PartyEvent::QueueLeft { party_id, reason })
            .await;
        self.write_snapshot(&party).await;

        Ok(())
    }

    async fn write_snapshot(&self, party: &Party) {
        if let Err(e) = self.snapshots.put(party).await {
            warn!("Failed to write snapshot for party {}: {}", party.id, e);
        }
    }

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, RegistryState>> {
        self.state.read().map_err(|_| {
            MatchmakingError::Internal {
                message: "registry lock poisoned".to_string(),
            }
            .into()
        })
    }

    fn lock_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RegistryState>> {
        self.state.write().map_err(|_| {
            MatchmakingError::Internal {
                message: "registry lock poisoned".to_string(),
            }
            .into()
        })
    }
}

fn party_not_found(party_id: PartyId) -> MatchmakingError {
    MatchmakingError::NotFound {
        kind: "party".to_string(),
        id: party_id.to_string(),
    }
}

fn illegal_state(operation: &str, status: PartyStatus) -> MatchmakingError {
    MatchmakingError::IllegalState {
        operation: operation.to_string(),
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::snapshot::InMemorySnapshotStore;
    use crate::config::EngineSettings;
    use crate::engine::worker::spawn_engine;
    use crate::events::publisher::MockEventPublisher;
    use crate::metrics::MetricsCollector;

    struct Harness {
        registry: Arc<PartyRegistry>,
        bus: Arc<EventBus>,
        engine: EngineHandle,
        publisher: Arc<MockEventPublisher>,
        snapshots: Arc<InMemorySnapshotStore>,
    }

    async fn harness() -> Harness {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let config = EngineSettings {
            tick_interval_ms: 3_600_000, // effectively manual ticks only
            ..EngineSettings::default()
        };
        let (engine, _outcomes, _join) = spawn_engine(config, metrics);

        let bus = Arc::new(EventBus::new(64));
        let publisher = Arc::new(MockEventPublisher::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let registry = Arc::new(PartyRegistry::new(
            bus.clone(),
            engine.clone(),
            snapshots.clone(),
            publisher.clone(),
        ));

        Harness {
            registry,
            bus,
            engine,
            publisher,
            snapshots,
        }
    }

    #[tokio::test]
    async fn test_create_and_join_flow() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();

        assert_eq!(party.status, PartyStatus::Idle);
        assert_eq!(party.size(), 1);
        assert!(party.members[0].ready, "leader starts ready");

        let party = h.registry.join_party(party.id, "bob", 1600).await.unwrap();
        assert_eq!(party.size(), 2);
        assert!(!party.members[1].ready);
        assert_eq!(h.snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_double_membership_conflicts() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        let other = h.registry.create_party("bob", 1500, "us-west", 5).await.unwrap();

        let err = h
            .registry
            .join_party(party.id, "bob", 1500)
            .await
            .unwrap_err();
        let err = err.downcast::<MatchmakingError>().unwrap();
        assert_eq!(err.kind(), "conflict");

        // bob is still only in his own party
        assert_eq!(h.registry.party_for_player("bob"), Some(other.id));
    }

    #[tokio::test]
    async fn test_queue_requires_leader_and_readiness() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry.join_party(party.id, "bob", 1600).await.unwrap();

        // Non-leader cannot queue
        let err = h
            .registry
            .enter_queue(party.id, "bob", "ranked", 5)
            .await
            .unwrap_err()
            .downcast::<MatchmakingError>()
            .unwrap();
        assert_eq!(err.kind(), "forbidden");

        // Leader cannot queue while bob is not ready
        let err = h
            .registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap_err()
            .downcast::<MatchmakingError>()
            .unwrap();
        assert_eq!(err.kind(), "illegal_state");

        h.registry.set_ready(party.id, "bob", true).await.unwrap();
        let entry = h
            .registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap();

        assert_eq!(entry.party_size, 2);
        assert_eq!(entry.avg_mmr, 1550);
        assert!(h.engine.is_queued(party.id).await.unwrap());
        assert_eq!(
            h.registry.get_party(party.id).unwrap().status,
            PartyStatus::Queueing
        );
    }

    #[tokio::test]
    async fn test_party_larger_than_team_rejected() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry.join_party(party.id, "bob", 1600).await.unwrap();
        h.registry.set_ready(party.id, "bob", true).await.unwrap();

        let err = h
            .registry
            .enter_queue(party.id, "alice", "duel", 1)
            .await
            .unwrap_err()
            .downcast::<MatchmakingError>()
            .unwrap();
        assert_eq!(err.kind(), "illegal_state");
    }

    #[tokio::test]
    async fn test_membership_mutations_rejected_while_queueing() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap();

        let err = h
            .registry
            .join_party(party.id, "bob", 1600)
            .await
            .unwrap_err()
            .downcast::<MatchmakingError>()
            .unwrap();
        assert_eq!(err.kind(), "illegal_state");

        let err = h
            .registry
            .set_ready(party.id, "alice", false)
            .await
            .unwrap_err()
            .downcast::<MatchmakingError>()
            .unwrap();
        assert_eq!(err.kind(), "illegal_state");
    }

    #[tokio::test]
    async fn test_leave_while_queueing_exits_queue_first() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry.join_party(party.id, "bob", 1600).await.unwrap();
        h.registry.set_ready(party.id, "bob", true).await.unwrap();
        h.registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap();

        let mut sub = h.bus.subscribe(party.id);
        h.registry.leave_party(party.id, "bob").await.unwrap();

        // queue_left(underpopulated) precedes member_left
        let first = sub.recv().await.unwrap();
        match first.event {
            PartyEvent::QueueLeft { reason, .. } => {
                assert_eq!(reason, QueueLeaveReason::Underpopulated)
            }
            other => panic!("expected queue_left, got {:?}", other),
        }
        let second = sub.recv().await.unwrap();
        assert_eq!(second.event.tag(), "member_left");

        assert!(!h.engine.is_queued(party.id).await.unwrap());
        assert_eq!(
            h.registry.get_party(party.id).unwrap().status,
            PartyStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_leader_leaving_disbands() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry.join_party(party.id, "bob", 1600).await.unwrap();

        h.registry.leave_party(party.id, "alice").await.unwrap();

        let party = h.registry.get_party(party.id).unwrap();
        assert_eq!(party.status, PartyStatus::Ended);
        // Remaining members are free to join other parties
        assert_eq!(h.registry.party_for_player("bob"), None);
    }

    #[tokio::test]
    async fn test_cancel_queue_publishes_reason() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        h.registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap();

        let mut sub = h.bus.subscribe(party.id);
        h.registry.leave_queue(party.id, "alice").await.unwrap();

        let frame = sub.recv().await.unwrap();
        match frame.event {
            PartyEvent::QueueLeft { reason, .. } => {
                assert_eq!(reason, QueueLeaveReason::Cancelled)
            }
            other => panic!("expected queue_left, got {:?}", other),
        }
        assert!(!h.engine.is_queued(party.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_match_lifecycle_to_session_end() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        let entry = h
            .registry
            .enter_queue(party.id, "alice", "ranked", 1)
            .await
            .unwrap();

        let found = Match {
            match_id: crate::utils::generate_match_id(),
            region: entry.region.clone(),
            mode: entry.mode.clone(),
            team_size: 1,
            teams: vec![vec!["alice".to_string()], vec!["bob".to_string()]],
            party_ids: vec![party.id],
            avg_mmr: 1500,
            mmr_variance: 0,
            quality_score: 0.9,
        };
        h.registry.apply_match(&found).await;

        assert_eq!(
            h.registry.get_party(party.id).unwrap().status,
            PartyStatus::Matched
        );
        assert_eq!(h.publisher.count_events_of_type("match_found"), 1);

        h.registry
            .end_session(party.id, found.match_id)
            .await
            .unwrap();
        assert_eq!(
            h.registry.get_party(party.id).unwrap().status,
            PartyStatus::Ended
        );
        assert_eq!(h.registry.party_for_player("alice"), None);
    }

    #[tokio::test]
    async fn test_timeout_returns_party_to_idle() {
        let h = harness().await;
        let party = h.registry.create_party("alice", 1500, "us-west", 5).await.unwrap();
        let entry = h
            .registry
            .enter_queue(party.id, "alice", "ranked", 5)
            .await
            .unwrap();

        let mut sub = h.bus.subscribe(party.id);
        h.registry.handle_queue_timeout(&entry).await;

        let frame = sub.recv().await.unwrap();
        match frame.event {
            PartyEvent::QueueLeft { reason, .. } => assert_eq!(reason, QueueLeaveReason::Timeout),
            other => panic!("expected queue_left, got {:?}", other),
        }
        assert_eq!(
            h.registry.get_party(party.id).unwrap().status,
            PartyStatus::Idle
        );
    }
}
