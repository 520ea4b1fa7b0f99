//! Common types used throughout the matchmaking service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for players
pub type PlayerId = String;

/// Unique identifier for parties
pub type PartyId = Uuid;

/// Unique identifier for matches
pub type MatchId = Uuid;

/// Lifecycle status of a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyStatus {
    Idle,
    Queueing,
    Matched,
    Ended,
}

impl std::fmt::Display for PartyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartyStatus::Idle => write!(f, "idle"),
            PartyStatus::Queueing => write!(f, "queueing"),
            PartyStatus::Matched => write!(f, "matched"),
            PartyStatus::Ended => write!(f, "ended"),
        }
    }
}

/// Reason a party left the matchmaking queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLeaveReason {
    Cancelled,
    Underpopulated,
    Timeout,
}

/// A single member of a party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyMember {
    pub player_id: PlayerId,
    /// Skill estimate supplied by the profile layer when the member joins
    pub mmr: i32,
    pub ready: bool,
    pub joined_at: DateTime<Utc>,
}

/// A group of 1..N players that queues as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub region: String,
    pub max_size: usize,
    pub members: Vec<PartyMember>,
    pub leader_id: PlayerId,
    pub status: PartyStatus,
    pub created_at: DateTime<Utc>,
}

impl Party {
    /// Current number of members
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, player_id: &str) -> bool {
        self.members.iter().any(|m| m.player_id == player_id)
    }

    pub fn member_mut(&mut self, player_id: &str) -> Option<&mut PartyMember> {
        self.members.iter_mut().find(|m| m.player_id == player_id)
    }

    /// True once every member has flagged ready
    pub fn all_ready(&self) -> bool {
        self.members.iter().all(|m| m.ready)
    }

    /// Integer mean of member MMRs
    pub fn avg_mmr(&self) -> i32 {
        if self.members.is_empty() {
            return 0;
        }
        let total: i64 = self.members.iter().map(|m| m.mmr as i64).sum();
        (total / self.members.len() as i64) as i32
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.members.iter().map(|m| m.player_id.clone()).collect()
    }
}

/// Composite key partitioning the queue; parties only match within one bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBucket {
    pub region: String,
    pub mode: String,
    pub team_size: usize,
}

impl QueueBucket {
    pub fn new(region: impl Into<String>, mode: impl Into<String>, team_size: usize) -> Self {
        Self {
            region: region.into(),
            mode: mode.into(),
            team_size,
        }
    }

    /// Telemetry label, `region:mode:team_size`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.region, self.mode, self.team_size)
    }
}

impl std::fmt::Display for QueueBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A waiting party as seen by the queue; immutable for its queue lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub party_id: PartyId,
    pub region: String,
    pub mode: String,
    pub team_size: usize,
    pub party_size: usize,
    pub avg_mmr: i32,
    pub enqueued_at: DateTime<Utc>,
    pub player_ids: Vec<PlayerId>,
}

impl QueueEntry {
    pub fn bucket(&self) -> QueueBucket {
        QueueBucket::new(self.region.clone(), self.mode.clone(), self.team_size)
    }
}

/// An emitted match; immutable once published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub region: String,
    pub mode: String,
    pub team_size: usize,
    /// teams[team_idx][player_idx]
    pub teams: Vec<Vec<PlayerId>>,
    pub party_ids: Vec<PartyId>,
    pub avg_mmr: i32,
    pub mmr_variance: i32,
    pub quality_score: f64,
}

impl Match {
    /// Total players across all teams
    pub fn player_count(&self) -> usize {
        self.teams.iter().map(|t| t.len()).sum()
    }
}

/// Every state change a party subscription can observe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PartyEvent {
    MemberJoined {
        party_id: PartyId,
        player_id: PlayerId,
    },
    MemberLeft {
        party_id: PartyId,
        player_id: PlayerId,
    },
    MemberReady {
        party_id: PartyId,
        player_id: PlayerId,
        ready: bool,
    },
    PartyUpdated {
        party: Party,
    },
    QueueEntered {
        entry: QueueEntry,
    },
    QueueLeft {
        party_id: PartyId,
        reason: QueueLeaveReason,
    },
    MatchFound {
        party_id: PartyId,
        #[serde(rename = "match")]
        found: Match,
    },
    SessionEnded {
        party_id: PartyId,
        match_id: MatchId,
    },
    Connected {
        party_id: PartyId,
        player_id: PlayerId,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
}

impl PartyEvent {
    /// Wire tag of this event
    pub fn tag(&self) -> &'static str {
        match self {
            PartyEvent::MemberJoined { .. } => "member_joined",
            PartyEvent::MemberLeft { .. } => "member_left",
            PartyEvent::MemberReady { .. } => "member_ready",
            PartyEvent::PartyUpdated { .. } => "party_updated",
            PartyEvent::QueueEntered { .. } => "queue_entered",
            PartyEvent::QueueLeft { .. } => "queue_left",
            PartyEvent::MatchFound { .. } => "match_found",
            PartyEvent::SessionEnded { .. } => "session_ended",
            PartyEvent::Connected { .. } => "connected",
            PartyEvent::Pong => "pong",
            PartyEvent::Error { .. } => "error",
        }
    }
}

/// An event paired with its per-party sequence number, as delivered to
/// subscribers and serialized onto the streaming surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub event: PartyEvent,
    pub seq: u64,
}
