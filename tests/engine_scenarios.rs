//! Engine-level matchmaking scenarios
//!
//! These tests drive the synchronous tick core directly with a controlled
//! clock, covering bucket isolation, band widening, timeouts, and the
//! fairness and uniqueness laws of match emission.

use chrono::{DateTime, Duration, Utc};
use rally_point::config::EngineSettings;
use rally_point::engine::tick::TickEngine;
use rally_point::types::QueueEntry;
use rally_point::utils::current_timestamp;
use uuid::Uuid;

fn entry_at(
    mmr: i32,
    party_size: usize,
    region: &str,
    mode: &str,
    team_size: usize,
    enqueued_at: DateTime<Utc>,
) -> QueueEntry {
    let party_id = Uuid::new_v4();
    QueueEntry {
        party_id,
        region: region.to_string(),
        mode: mode.to_string(),
        team_size,
        party_size,
        avg_mmr: mmr,
        enqueued_at,
        player_ids: (0..party_size).map(|i| format!("{party_id}_p{i}")).collect(),
    }
}

fn ranked_entry(mmr: i32, party_size: usize, enqueued_at: DateTime<Utc>) -> QueueEntry {
    entry_at(mmr, party_size, "us-west", "ranked", 5, enqueued_at)
}

fn engine() -> TickEngine {
    TickEngine::new(EngineSettings::default())
}

#[test]
fn test_ten_solos_form_one_full_match() {
    let mut engine = engine();
    let now = current_timestamp();

    for i in 0..10 {
        engine.enqueue(ranked_entry(1500 + i * 10, 1, now)).unwrap();
    }

    let report = engine.tick(now);

    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.teams.len(), 2);
    assert_eq!(m.teams[0].len(), 5);
    assert_eq!(m.teams[1].len(), 5);
    assert_eq!(engine.queue_size(), 0);
    assert!(m.quality_score > 0.7, "quality was {}", m.quality_score);
}

#[test]
fn test_party_of_three_stays_together() {
    let mut engine = engine();
    let now = current_timestamp();

    let trio = ranked_entry(1500, 3, now);
    let trio_players = trio.player_ids.clone();
    engine.enqueue(trio).unwrap();
    for _ in 0..7 {
        engine.enqueue(ranked_entry(1500, 1, now)).unwrap();
    }

    let report = engine.tick(now);

    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.player_count(), 10);
    assert_eq!(m.teams[0].len(), 5);
    assert_eq!(m.teams[1].len(), 5);

    // The trio's players all land on one team
    let trio_teams: Vec<usize> = m
        .teams
        .iter()
        .enumerate()
        .filter(|(_, team)| team.iter().any(|p| trio_players.contains(p)))
        .map(|(idx, _)| idx)
        .collect();
    assert_eq!(trio_teams.len(), 1);
}

#[test]
fn test_incompatible_mmr_times_out_at_the_wait_bound() {
    let mut engine = engine();
    let start = current_timestamp();

    engine.enqueue(ranked_entry(1000, 1, start)).unwrap();
    engine.enqueue(ranked_entry(2000, 1, start)).unwrap();

    // Spread 1000 exceeds even the max band of 500; no tick matches them
    for offset in [0, 30, 60, 90, 119] {
        let report = engine.tick(start + Duration::seconds(offset));
        assert!(report.matches.is_empty());
        assert!(report.timeouts.is_empty());
        assert_eq!(engine.queue_size(), 2);
    }

    // Past the 120 second bound both entries are retired with a timeout
    let report = engine.tick(start + Duration::seconds(121));
    assert!(report.matches.is_empty());
    assert_eq!(report.timeouts.len(), 2);
    assert_eq!(engine.queue_size(), 0);
}

#[test]
fn test_regions_never_mix() {
    let mut engine = engine();
    let now = current_timestamp();

    engine
        .enqueue(entry_at(1500, 5, "us-west", "ranked", 5, now))
        .unwrap();
    engine
        .enqueue(entry_at(1500, 5, "eu-west", "ranked", 5, now))
        .unwrap();

    let report = engine.tick(now);
    assert!(report.matches.is_empty());
    assert_eq!(engine.queue_size(), 2);
}

#[test]
fn test_modes_never_mix() {
    let mut engine = engine();
    let now = current_timestamp();

    engine
        .enqueue(entry_at(1500, 5, "us-west", "ranked", 5, now))
        .unwrap();
    engine
        .enqueue(entry_at(1500, 5, "us-west", "casual", 5, now))
        .unwrap();

    let report = engine.tick(now);
    assert!(report.matches.is_empty());
    assert_eq!(engine.queue_size(), 2);
}

#[test]
fn test_band_growth_unlocks_wider_spreads() {
    // 2v2 configuration exercises the growth law with four solos
    let mut engine = engine();
    let start = current_timestamp();

    for mmr in [1000, 1100, 1200, 1300] {
        engine
            .enqueue(entry_at(mmr, 1, "us-west", "ranked", 2, start))
            .unwrap();
    }

    // Spread 300 > initial tolerance 100
    let report = engine.tick(start);
    assert!(report.matches.is_empty());

    // After 20 seconds the oldest entry's tolerance is 100 + 20*10 = 300
    let report = engine.tick(start + Duration::seconds(20));
    assert_eq!(report.matches.len(), 1);
    assert_eq!(report.matches[0].player_count(), 4);
}

#[test]
fn test_emitted_teams_partition_the_removed_parties() {
    let mut engine = engine();
    let now = current_timestamp();

    let entries: Vec<QueueEntry> = (0..8)
        .map(|i| ranked_entry(1500 + i * 5, if i == 0 { 3 } else { 1 }, now))
        .collect();
    let mut all_players: Vec<String> = entries
        .iter()
        .flat_map(|e| e.player_ids.clone())
        .collect();
    for entry in entries {
        engine.enqueue(entry).unwrap();
    }

    let report = engine.tick(now);
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];

    // Flattened teams equal the exact multiset of the removed parties' players
    let mut matched_players: Vec<String> = m.teams.iter().flatten().cloned().collect();
    matched_players.sort();
    all_players.sort();
    assert_eq!(matched_players, all_players);

    // And none of the removed parties remain queued
    for party_id in &m.party_ids {
        assert!(!engine.is_queued(party_id));
    }
}

#[test]
fn test_match_ids_are_unique_v4_uuids() {
    let mut engine = engine();
    let now = current_timestamp();

    for _ in 0..40 {
        engine.enqueue(ranked_entry(1500, 1, now)).unwrap();
    }

    let report = engine.tick(now);
    assert_eq!(report.matches.len(), 4);

    let mut seen = std::collections::HashSet::new();
    for m in &report.matches {
        assert!(seen.insert(m.match_id), "duplicate match id");
        assert_eq!(m.match_id.get_version_num(), 4);

        // xxxxxxxx-xxxx-4xxx-[89ab]xxx-xxxxxxxxxxxx
        let text = m.match_id.to_string();
        let fields: Vec<&str> = text.split('-').collect();
        assert_eq!(fields.len(), 5);
        assert!(fields[2].starts_with('4'));
        assert!(matches!(
            fields[3].chars().next().unwrap(),
            '8' | '9' | 'a' | 'b'
        ));
    }
}

#[test]
fn test_oldest_parties_matched_first() {
    let mut engine = engine();
    let now = current_timestamp();

    // Ten old parties and ten fresh ones; one tick can match both groups,
    // but the old group must fill the first emitted match
    let old: Vec<QueueEntry> = (0..10)
        .map(|_| ranked_entry(1500, 1, now - Duration::seconds(60)))
        .collect();
    let old_ids: Vec<Uuid> = old.iter().map(|e| e.party_id).collect();
    let fresh: Vec<QueueEntry> = (0..10).map(|_| ranked_entry(1500, 1, now)).collect();

    for entry in fresh {
        engine.enqueue(entry).unwrap();
    }
    for entry in old {
        engine.enqueue(entry).unwrap();
    }

    let report = engine.tick(now);
    assert_eq!(report.matches.len(), 2);

    let mut first_match_parties = report.matches[0].party_ids.clone();
    first_match_parties.sort();
    let mut expected = old_ids;
    expected.sort();
    assert_eq!(first_match_parties, expected);
}

#[test]
fn test_no_party_appears_in_two_matches() {
    let mut engine = engine();
    let now = current_timestamp();

    for _ in 0..30 {
        engine.enqueue(ranked_entry(1500, 2, now)).unwrap();
    }

    let report = engine.tick(now);
    assert!(!report.matches.is_empty());

    let mut seen = std::collections::HashSet::new();
    for m in &report.matches {
        for party_id in &m.party_ids {
            assert!(seen.insert(*party_id), "party matched twice");
        }
    }
}

#[test]
fn test_queue_count_decreases_by_matched_party_count() {
    let mut engine = engine();
    let now = current_timestamp();

    for _ in 0..15 {
        engine.enqueue(ranked_entry(1500, 1, now)).unwrap();
    }
    assert_eq!(engine.queue_size(), 15);

    let report = engine.tick(now);
    assert_eq!(report.matches.len(), 1);
    assert_eq!(
        engine.queue_size(),
        15 - report.matches[0].party_ids.len()
    );
}
