//! Bucketed in-memory store of waiting parties
//!
//! Parties are indexed by `(region, mode, team_size)` bucket with an O(1)
//! `party_id -> bucket` lookup. The store is owned by the tick worker; all
//! mutation happens on that single task.

use crate::error::{MatchmakingError, Result};
use crate::types::{PartyId, QueueBucket, QueueEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// In-memory queue store
#[derive(Debug, Default)]
pub struct QueueStore {
    /// Queue storage: bucket -> entries, kept oldest-first
    buckets: HashMap<QueueBucket, Vec<QueueEntry>>,
    /// Fast lookup: party_id -> bucket
    party_to_bucket: HashMap<PartyId, QueueBucket>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry to its bucket. Fails with `conflict` if the party is
    /// already queued.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<()> {
        if self.party_to_bucket.contains_key(&entry.party_id) {
            return Err(MatchmakingError::Conflict {
                reason: format!("party {} is already queued", entry.party_id),
            }
            .into());
        }

        let bucket = entry.bucket();
        let entries = self.buckets.entry(bucket.clone()).or_default();

        // Keep the bucket sorted by enqueue time; gossiped entries may arrive
        // out of order, local ones always append.
        let pos = entries.partition_point(|e| e.enqueued_at <= entry.enqueued_at);
        self.party_to_bucket.insert(entry.party_id, bucket);
        entries.insert(pos, entry);

        Ok(())
    }

    /// Remove a party's entry. Idempotent: returns `false` when the party is
    /// not queued.
    pub fn dequeue(&mut self, party_id: &PartyId) -> bool {
        let Some(bucket) = self.party_to_bucket.remove(party_id) else {
            return false;
        };

        if let Some(entries) = self.buckets.get_mut(&bucket) {
            entries.retain(|e| e.party_id != *party_id);
            if entries.is_empty() {
                self.buckets.remove(&bucket);
            }
        }

        true
    }

    pub fn is_queued(&self, party_id: &PartyId) -> bool {
        self.party_to_bucket.contains_key(party_id)
    }

    /// Yield each non-empty bucket's entries, oldest-first within the bucket.
    pub fn tick_buckets(&self) -> impl Iterator<Item = (&QueueBucket, &[QueueEntry])> {
        self.buckets
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(bucket, entries)| (bucket, entries.as_slice()))
    }

    /// Keys of every non-empty bucket, cloned so the tick walk can mutate the
    /// store while iterating.
    pub fn bucket_keys(&self) -> Vec<QueueBucket> {
        self.buckets
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(bucket, _)| bucket.clone())
            .collect()
    }

    /// Entries of one bucket, oldest-first. Empty slice for unknown buckets.
    pub fn entries(&self, bucket: &QueueBucket) -> &[QueueEntry] {
        self.buckets.get(bucket).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove and return every entry in `bucket` that has waited longer than
    /// `max_wait` as of `now`.
    pub fn retire_timed_out(
        &mut self,
        bucket: &QueueBucket,
        now: DateTime<Utc>,
        max_wait: Duration,
    ) -> Vec<QueueEntry> {
        let Some(entries) = self.buckets.get_mut(bucket) else {
            return Vec::new();
        };

        let max_wait = chrono::Duration::from_std(max_wait).unwrap_or(chrono::Duration::zero());
        let mut retired = Vec::new();
        let mut kept = Vec::with_capacity(entries.len());

        for entry in entries.drain(..) {
            if now - entry.enqueued_at > max_wait {
                retired.push(entry);
            } else {
                kept.push(entry);
            }
        }
        *entries = kept;

        for entry in &retired {
            self.party_to_bucket.remove(&entry.party_id);
        }
        if self.buckets.get(bucket).is_some_and(Vec::is_empty) {
            self.buckets.remove(bucket);
        }

        retired
    }

    /// Remove the given parties from their buckets and the lookup index.
    pub fn remove_parties(&mut self, party_ids: &[PartyId]) {
        for party_id in party_ids {
            self.dequeue(party_id);
        }
    }

    /// Total queued parties across all buckets
    pub fn size(&self) -> usize {
        self.party_to_bucket.len()
    }

    /// Queued parties in one bucket
    pub fn size_in(&self, bucket: &QueueBucket) -> usize {
        self.buckets.get(bucket).map(Vec::len).unwrap_or(0)
    }

    /// Per-bucket sizes keyed by the bucket's telemetry label
    pub fn sizes_by_bucket(&self) -> HashMap<String, usize> {
        self.buckets
            .iter()
            .map(|(bucket, entries)| (bucket.key(), entries.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::current_timestamp;
    use uuid::Uuid;

    fn entry(mmr: i32) -> QueueEntry {
        let party_id = Uuid::new_v4();
        QueueEntry {
            party_id,
            region: "us-west".to_string(),
            mode: "ranked".to_string(),
            team_size: 5,
            party_size: 1,
            avg_mmr: mmr,
            enqueued_at: current_timestamp(),
            player_ids: vec![format!("{}_p0", party_id)],
        }
    }

    #[test]
    fn test_enqueue_dequeue() {
        let mut store = QueueStore::new();
        let e = entry(1500);
        let party_id = e.party_id;

        store.enqueue(e).unwrap();
        assert_eq!(store.size(), 1);
        assert!(store.is_queued(&party_id));

        assert!(store.dequeue(&party_id));
        assert_eq!(store.size(), 0);
        assert!(!store.is_queued(&party_id));
    }

    #[test]
    fn test_double_enqueue_conflicts() {
        let mut store = QueueStore::new();
        let e = entry(1500);
        store.enqueue(e.clone()).unwrap();
        assert!(store.enqueue(e).is_err());
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_dequeue_absent_is_noop() {
        let mut store = QueueStore::new();
        assert!(!store.dequeue(&Uuid::new_v4()));
    }

    #[test]
    fn test_buckets_are_isolated() {
        let mut store = QueueStore::new();
        let mut eu = entry(1500);
        eu.region = "eu-west".to_string();
        let us = entry(1500);

        store.enqueue(us).unwrap();
        store.enqueue(eu).unwrap();

        assert_eq!(store.size(), 2);
        assert_eq!(
            store.size_in(&QueueBucket::new("us-west", "ranked", 5)),
            1
        );
        assert_eq!(
            store.size_in(&QueueBucket::new("eu-west", "ranked", 5)),
            1
        );
        assert_eq!(store.sizes_by_bucket().len(), 2);
    }

    #[test]
    fn test_entries_kept_oldest_first() {
        let mut store = QueueStore::new();
        let now = current_timestamp();

        let mut late = entry(1500);
        late.enqueued_at = now;
        let mut early = entry(1500);
        early.enqueued_at = now - chrono::Duration::seconds(30);

        // Insert newest first; the store must still iterate oldest-first
        let early_id = early.party_id;
        store.enqueue(late).unwrap();
        store.enqueue(early).unwrap();

        let bucket = QueueBucket::new("us-west", "ranked", 5);
        assert_eq!(store.entries(&bucket)[0].party_id, early_id);
    }

    #[test]
    fn test_retire_timed_out() {
        let mut store = QueueStore::new();
        let now = current_timestamp();

        let mut stale = entry(1500);
        stale.enqueued_at = now - chrono::Duration::seconds(130);
        let fresh = entry(1500);
        let stale_id = stale.party_id;
        let fresh_id = fresh.party_id;

        store.enqueue(stale).unwrap();
        store.enqueue(fresh).unwrap();

        let bucket = QueueBucket::new("us-west", "ranked", 5);
        let retired = store.retire_timed_out(&bucket, now, Duration::from_secs(120));

        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].party_id, stale_id);
        assert!(!store.is_queued(&stale_id));
        assert!(store.is_queued(&fresh_id));
    }

    #[test]
    fn test_remove_parties_keeps_index_consistent() {
        let mut store = QueueStore::new();
        let a = entry(1500);
        let b = entry(1510);
        let a_id = a.party_id;
        let b_id = b.party_id;
        store.enqueue(a).unwrap();
        store.enqueue(b).unwrap();

        store.remove_parties(&[a_id, b_id]);
        assert_eq!(store.size(), 0);
        assert!(store.tick_buckets().next().is_none());
    }
}
