//! Team formation for a single queue bucket
//!
//! Pure functions: given oldest-first candidates and an MMR tolerance, either
//! produce a balanced team assignment with a quality score or report that no
//! assignment exists. The tick engine owns quality thresholds and match ids.

use crate::types::{PartyId, PlayerId, QueueEntry};

/// A valid assignment of parties to teams, before the engine stamps it into a
/// [`crate::types::Match`]
#[derive(Debug, Clone)]
pub struct TeamAssignment {
    /// teams[team_idx][player_idx]
    pub teams: Vec<Vec<PlayerId>>,
    pub party_ids: Vec<PartyId>,
    pub avg_mmr: i32,
    pub mmr_variance: i32,
    pub quality_score: f64,
}

/// Try to form a match from the oldest-first candidate list.
///
/// Walks prefixes of the candidates; a prefix is viable when its player count
/// is exactly `team_size * num_teams`, its MMR spread fits inside
/// `mmr_tolerance`, and every party fits whole into some team. The first
/// viable prefix wins, which keeps the longest-waiting parties first.
pub fn try_form_match(
    entries: &[QueueEntry],
    team_size: usize,
    num_teams: usize,
    mmr_tolerance: i32,
) -> Option<TeamAssignment> {
    if entries.is_empty() {
        return None;
    }

    let players_needed = team_size * num_teams;
    let total_available: usize = entries.iter().map(|e| e.party_size).sum();
    if total_available < players_needed {
        return None;
    }

    let mut player_count = entries[0].party_size;
    for prefix_len in 2..=entries.len() {
        player_count += entries[prefix_len - 1].party_size;
        if player_count < players_needed {
            continue;
        }
        // Prefix sums only grow; past the exact requirement no later prefix
        // can produce legal team sizes without splitting a party.
        if player_count > players_needed {
            return None;
        }

        let prefix = &entries[..prefix_len];
        if mmr_spread(prefix) > mmr_tolerance {
            continue;
        }

        let Some(teams) = balance_teams(prefix, team_size, num_teams) else {
            continue;
        };

        return Some(build_assignment(prefix, &teams, num_teams));
    }

    None
}

/// MMR spread (max - min of party averages) across a candidate set
fn mmr_spread(entries: &[QueueEntry]) -> i32 {
    let min = entries.iter().map(|e| e.avg_mmr).min().unwrap_or(0);
    let max = entries.iter().map(|e| e.avg_mmr).max().unwrap_or(0);
    max - min
}

/// Greedy longest-processing-time-first balancing.
///
/// Parties sorted by average MMR descending are each assigned to the team
/// with the lowest weighted MMR sum that still has room for the whole party
/// (ties break toward the lower team index). Returns per-team entry indices
/// into `entries`, or `None` when some party fits no team.
fn balance_teams(entries: &[QueueEntry], team_size: usize, num_teams: usize) -> Option<Vec<Vec<usize>>> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[b].avg_mmr.cmp(&entries[a].avg_mmr));

    let mut teams: Vec<Vec<usize>> = vec![Vec::new(); num_teams];
    let mut team_mmr_sums: Vec<i64> = vec![0; num_teams];
    let mut team_player_counts: Vec<usize> = vec![0; num_teams];

    for idx in order {
        let entry = &entries[idx];
        let mut chosen: Option<usize> = None;

        for team_idx in 0..num_teams {
            if team_player_counts[team_idx] + entry.party_size > team_size {
                continue;
            }
            match chosen {
                Some(best) if team_mmr_sums[team_idx] >= team_mmr_sums[best] => {}
                _ => chosen = Some(team_idx),
            }
        }

        let team_idx = chosen?;
        teams[team_idx].push(idx);
        team_mmr_sums[team_idx] += entry.avg_mmr as i64 * entry.party_size as i64;
        team_player_counts[team_idx] += entry.party_size;
    }

    Some(teams)
}

fn build_assignment(
    entries: &[QueueEntry],
    teams: &[Vec<usize>],
    num_teams: usize,
) -> TeamAssignment {
    let mut assignment_teams: Vec<Vec<PlayerId>> = vec![Vec::new(); num_teams];
    let mut party_ids = Vec::with_capacity(entries.len());

    for (team_idx, members) in teams.iter().enumerate() {
        for &entry_idx in members {
            let entry = &entries[entry_idx];
            assignment_teams[team_idx].extend(entry.player_ids.iter().cloned());
            party_ids.push(entry.party_id);
        }
    }

    let avg_mmr = weighted_avg_mmr(entries);
    let mmr_variance = weighted_mmr_variance(entries);
    let quality_score = match_quality(entries, teams, mmr_variance);

    TeamAssignment {
        teams: assignment_teams,
        party_ids,
        avg_mmr,
        mmr_variance,
        quality_score,
    }
}

/// Player-weighted integer mean of party average MMRs
fn weighted_avg_mmr(entries: &[QueueEntry]) -> i32 {
    let total_players: i64 = entries.iter().map(|e| e.party_size as i64).sum();
    if total_players == 0 {
        return 0;
    }
    let total_mmr: i64 = entries
        .iter()
        .map(|e| e.avg_mmr as i64 * e.party_size as i64)
        .sum();
    (total_mmr / total_players) as i32
}

/// Player-weighted standard deviation of party average MMRs, floored to an
/// integer (integer division inside the square root, matching the rest of the
/// MMR arithmetic)
fn weighted_mmr_variance(entries: &[QueueEntry]) -> i32 {
    let total_players: i64 = entries.iter().map(|e| e.party_size as i64).sum();
    if total_players == 0 {
        return 0;
    }

    let avg = weighted_avg_mmr(entries) as i64;
    let sum_squared_diff: i64 = entries
        .iter()
        .map(|e| {
            let diff = e.avg_mmr as i64 - avg;
            diff * diff * e.party_size as i64
        })
        .sum();

    ((sum_squared_diff / total_players) as f64).sqrt() as i32
}

/// Composite match quality in [0, 1]:
/// `0.5 * team balance + 0.3 * variance score + 0.2 * wait fairness`
fn match_quality(entries: &[QueueEntry], teams: &[Vec<usize>], mmr_variance: i32) -> f64 {
    // Factor 1: MMR balance between teams (higher is better)
    let team_mmrs: Vec<i32> = teams
        .iter()
        .filter_map(|members| {
            let players: i64 = members.iter().map(|&i| entries[i].party_size as i64).sum();
            if players == 0 {
                return None;
            }
            let mmr: i64 = members
                .iter()
                .map(|&i| entries[i].avg_mmr as i64 * entries[i].party_size as i64)
                .sum();
            Some((mmr / players) as i32)
        })
        .collect();

    let mmr_balance = if team_mmrs.len() >= 2 {
        let max = *team_mmrs.iter().max().unwrap();
        let min = *team_mmrs.iter().min().unwrap();
        1.0 - f64::from((max - min).min(500)) / 500.0
    } else {
        1.0
    };

    // Factor 2: low MMR variance within the match is better
    let variance_score = 1.0 - f64::from(mmr_variance.clamp(0, 1000)) / 1000.0;

    let wait_score = wait_fairness(entries);

    (mmr_balance * 0.5) + (variance_score * 0.3) + (wait_score * 0.2)
}

/// Wait-time fairness factor of the quality score.
///
/// Constant for now; the intended extension point for weighting matches that
/// clear out long-waiting parties.
fn wait_fairness(_entries: &[QueueEntry]) -> f64 {
    1.0
}
