//! Per-tick matchmaking over the bucketed queue
//!
//! Each tick walks every non-empty bucket: retire entries past the wait
//! bound, widen the MMR band from the oldest remaining entry's wait time,
//! and pull matches out of the bucket until the team builder comes up empty
//! or quality drops below the configured floor.

use crate::config::EngineSettings;
use crate::queue::store::QueueStore;
use crate::queue::team_builder::{self, TeamAssignment};
use crate::types::{Match, QueueBucket, QueueEntry};
use crate::utils::{generate_match_id, wait_seconds};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Everything one tick produced
#[derive(Debug, Default)]
pub struct TickReport {
    pub matches: Vec<Match>,
    /// Entries retired after exceeding the max wait bound
    pub timeouts: Vec<QueueEntry>,
}

/// The matchmaking clock's synchronous core. Owns the queue store.
pub struct TickEngine {
    config: EngineSettings,
    store: QueueStore,
}

impl TickEngine {
    pub fn new(config: EngineSettings) -> Self {
        Self {
            config,
            store: QueueStore::new(),
        }
    }

    pub fn enqueue(&mut self, entry: QueueEntry) -> crate::error::Result<()> {
        self.store.enqueue(entry)
    }

    pub fn dequeue(&mut self, party_id: &crate::types::PartyId) -> bool {
        self.store.dequeue(party_id)
    }

    pub fn is_queued(&self, party_id: &crate::types::PartyId) -> bool {
        self.store.is_queued(party_id)
    }

    pub fn queue_size(&self) -> usize {
        self.store.size()
    }

    pub fn sizes_by_bucket(&self) -> HashMap<String, usize> {
        self.store.sizes_by_bucket()
    }

    /// Run one matchmaking pass as of `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for bucket in self.store.bucket_keys() {
            // Timed-out entries leave first, even from buckets too small to match
            let retired = self
                .store
                .retire_timed_out(&bucket, now, self.max_wait_time());
            if !retired.is_empty() {
                debug!(
                    "Retired {} timed-out entries from bucket {}",
                    retired.len(),
                    bucket
                );
                report.timeouts.extend(retired);
            }

            if self.store.size_in(&bucket) < 2 {
                continue;
            }

            // Pull matches until the bucket runs dry or quality drops
            loop {
                let entries = self.store.entries(&bucket);
                if entries.len() < 2 {
                    break;
                }

                let tolerance = self.mmr_band(&entries[0], now);
                let Some(assignment) = team_builder::try_form_match(
                    entries,
                    bucket.team_size,
                    self.config.num_teams,
                    tolerance,
                ) else {
                    break;
                };

                if assignment.quality_score < self.config.min_match_quality {
                    debug!(
                        "Best candidate in bucket {} below quality floor ({:.2} < {:.2})",
                        bucket, assignment.quality_score, self.config.min_match_quality
                    );
                    break;
                }

                let formed = self.stamp_match(&bucket, assignment);
                self.store.remove_parties(&formed.party_ids);
                debug!(
                    "Formed match {} in bucket {} - quality: {:.2}, tolerance: {}",
                    formed.match_id, bucket, formed.quality_score, tolerance
                );
                report.matches.push(formed);
            }
        }

        report
    }

    /// Active MMR tolerance for a bucket, widened by the given entry's wait
    fn mmr_band(&self, entry: &QueueEntry, now: DateTime<Utc>) -> i32 {
        let waited = wait_seconds(entry.enqueued_at, now);
        let band = self.config.mmr_band_initial as i64
            + waited * self.config.mmr_band_growth_per_sec as i64;
        band.min(self.config.mmr_band_max as i64) as i32
    }

    fn stamp_match(&self, bucket: &QueueBucket, assignment: TeamAssignment) -> Match {
        Match {
            match_id: generate_match_id(),
            region: bucket.region.clone(),
            mode: bucket.mode.clone(),
            team_size: bucket.team_size,
            teams: assignment.teams,
            party_ids: assignment.party_ids,
            avg_mmr: assignment.avg_mmr,
            mmr_variance: assignment.mmr_variance,
            quality_score: assignment.quality_score,
        }
    }

    fn max_wait_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.max_wait_time_seconds)
    }
}
