//! Durable party snapshots
//!
//! The state machine writes a snapshot on every transition so reconnecting
//! clients can obtain the authoritative party view from the HTTP layer. The
//! engine keeps no other persistent state.

use crate::error::{MatchmakingError, Result};
use crate::types::{Party, PartyId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Durable KV of party records keyed by party id
#[async_trait]
pub trait PartySnapshotStore: Send + Sync {
    async fn get(&self, party_id: PartyId) -> Result<Option<Party>>;
    async fn put(&self, party: &Party) -> Result<()>;
    async fn delete(&self, party_id: PartyId) -> Result<()>;
}

/// Filesystem-backed store: one JSON blob per party, written atomically via
/// a temp file rename.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, party_id: PartyId) -> PathBuf {
        self.dir.join(format!("{}.json", party_id))
    }

    fn transport(message: String) -> anyhow::Error {
        MatchmakingError::Transport { message }.into()
    }
}

#[async_trait]
impl PartySnapshotStore for FileSnapshotStore {
    async fn get(&self, party_id: PartyId) -> Result<Option<Party>> {
        let path = self.path_for(party_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::transport(format!("read {}: {}", path.display(), e))),
        };

        let party = serde_json::from_slice(&data)
            .map_err(|e| Self::transport(format!("decode snapshot {}: {}", party_id, e)))?;
        Ok(Some(party))
    }

    async fn put(&self, party: &Party) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::transport(format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.path_for(party.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec(party)
            .map_err(|e| Self::transport(format!("encode snapshot {}: {}", party.id, e)))?;

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Self::transport(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::transport(format!("rename {}: {}", path.display(), e)))?;

        debug!("Wrote snapshot for party {}", party.id);
        Ok(())
    }

    async fn delete(&self, party_id: PartyId) -> Result<()> {
        let path = self.path_for(party_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::transport(format!(
                "delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// In-memory test double
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    parties: RwLock<HashMap<PartyId, Party>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots (for tests)
    pub fn len(&self) -> usize {
        self.parties.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PartySnapshotStore for InMemorySnapshotStore {
    async fn get(&self, party_id: PartyId) -> Result<Option<Party>> {
        let parties = self.parties.read().map_err(|_| MatchmakingError::Internal {
            message: "snapshot lock poisoned".to_string(),
        })?;
        Ok(parties.get(&party_id).cloned())
    }

    async fn put(&self, party: &Party) -> Result<()> {
        let mut parties = self.parties.write().map_err(|_| MatchmakingError::Internal {
            message: "snapshot lock poisoned".to_string(),
        })?;
        parties.insert(party.id, party.clone());
        Ok(())
    }

    async fn delete(&self, party_id: PartyId) -> Result<()> {
        let mut parties = self.parties.write().map_err(|_| MatchmakingError::Internal {
            message: "snapshot lock poisoned".to_string(),
        })?;
        parties.remove(&party_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartyMember, PartyStatus};
    use crate::utils::{current_timestamp, generate_party_id};

    fn test_party() -> Party {
        Party {
            id: generate_party_id(),
            region: "us-west".to_string(),
            max_size: 5,
            members: vec![PartyMember {
                player_id: "p1".to_string(),
                mmr: 1500,
                ready: true,
                joined_at: current_timestamp(),
            }],
            leader_id: "p1".to_string(),
            status: PartyStatus::Idle,
            created_at: current_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = InMemorySnapshotStore::new();
        let party = test_party();

        assert!(store.get(party.id).await.unwrap().is_none());
        store.put(&party).await.unwrap();

        let loaded = store.get(party.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, party.id);
        assert_eq!(loaded.members.len(), 1);

        store.delete(party.id).await.unwrap();
        assert!(store.get(party.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_delete_absent_is_noop() {
        let store = InMemorySnapshotStore::new();
        store.delete(generate_party_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rally-point-test-{}", uuid::Uuid::new_v4()));
        let store = FileSnapshotStore::new(&dir);
        let party = test_party();

        store.put(&party).await.unwrap();
        let loaded = store.get(party.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, party.id);
        assert_eq!(loaded.status, PartyStatus::Idle);

        store.delete(party.id).await.unwrap();
        assert!(store.get(party.id).await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
