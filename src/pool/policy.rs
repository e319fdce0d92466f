//! Credential selection policies.
//!
//! `Smart` is the default: a composite score over health, load and token
//! freshness, with a randomized tie-break so equally good credentials share
//! traffic. `Priority` and `Balanced` are simpler deterministic modes kept
//! for operators who want predictable routing.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingPolicy {
    Priority,
    Balanced,
    #[default]
    Smart,
}

/// The per-candidate facts selection works from. Collected under the pool
/// lock, scored outside any awaits.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    /// Position in insertion order.
    pub rank: usize,
    pub inflight: u32,
    pub recent_requests: usize,
    pub health_score: i32,
    pub idle_secs: Option<f64>,
    pub avg_latency_ms: f64,
    pub token_expires_in_secs: Option<i64>,
}

pub fn select(policy: SchedulingPolicy, candidates: &[Candidate]) -> Option<String> {
    match policy {
        SchedulingPolicy::Priority => candidates
            .iter()
            .min_by_key(|c| c.rank)
            .map(|c| c.id.clone()),
        SchedulingPolicy::Balanced => candidates
            .iter()
            .min_by_key(|c| c.inflight as u64 * 1000 + c.recent_requests as u64)
            .map(|c| c.id.clone()),
        SchedulingPolicy::Smart => select_smart(candidates),
    }
}

fn select_smart(candidates: &[Candidate]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    let avg_recent: f64 =
        candidates.iter().map(|c| c.recent_requests as f64).sum::<f64>() / candidates.len() as f64;

    let scored: Vec<(f64, &Candidate)> = candidates
        .iter()
        .map(|c| (smart_score(c, avg_recent), c))
        .collect();

    let top = scored
        .iter()
        .map(|(s, _)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    // Everything within 15% of the leader is considered equivalent.
    let floor = top - top.abs() * 0.15;
    let pool: Vec<&Candidate> = scored
        .iter()
        .filter(|(s, _)| *s >= floor)
        .map(|(_, c)| *c)
        .collect();

    pool.choose(&mut rand::thread_rng()).map(|c| c.id.clone())
}

fn smart_score(c: &Candidate, avg_recent: f64) -> f64 {
    let mut score = c.health_score as f64;
    score -= 30.0 * c.inflight as f64;

    // Usage deviation: busier than the pool average costs up to 40 points,
    // quieter earns up to 30.
    let baseline = avg_recent.max(1.0);
    let deviation = c.recent_requests as f64 - avg_recent;
    if deviation > 0.0 {
        score -= (deviation / baseline * 40.0).min(40.0);
    } else if deviation < 0.0 {
        score += (-deviation / baseline * 30.0).min(30.0);
    }

    match c.idle_secs {
        Some(idle) if idle >= 30.0 => score += 20.0,
        None => score += 20.0, // never used at all
        _ => {}
    }

    if c.avg_latency_ms > 0.0 && c.avg_latency_ms < 5_000.0 {
        score += 10.0;
    }

    if let Some(expires_in) = c.token_expires_in_secs {
        if expires_in < 300 {
            score -= 15.0;
        } else if expires_in < 600 {
            score -= 10.0;
        } else if expires_in < 900 {
            score -= 5.0;
        }
    }

    score
}
