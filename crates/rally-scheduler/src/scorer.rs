//! Influence scorer — ranks candidate recipients by weighted activity.
//! Pure: no I/O, no clock.

use std::cmp::Ordering;
use std::collections::HashMap;

use rally_core::types::ActivityMetrics;

pub const MESSAGE_WEIGHT: f64 = 0.3;
pub const RESPONSE_WEIGHT: f64 = 0.3;
pub const MENTION_WEIGHT: f64 = 0.2;
pub const RECENCY_WEIGHT: f64 = 0.2;

/// Weighted activity score. Non-finite results count as zero.
pub fn score(m: &ActivityMetrics) -> f64 {
    let s = MESSAGE_WEIGHT * m.message_count
        + RESPONSE_WEIGHT * m.response_rate
        + MENTION_WEIGHT * m.mention_count
        + RECENCY_WEIGHT * m.recency;
    if s.is_finite() { s } else { 0.0 }
}

/// A participant with its computed score.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub id: String,
    pub score: f64,
}

/// Rank participants: highest score first, ties broken by id ascending.
/// Participants without metrics score zero.
pub fn rank(participants: &[String], metrics: &HashMap<String, ActivityMetrics>) -> Vec<Ranked> {
    let mut ranked: Vec<Ranked> = participants
        .iter()
        .map(|id| Ranked {
            id: id.clone(),
            score: metrics.get(id).map(score).unwrap_or(0.0),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Participant ids in priority order.
pub fn priority_list(
    participants: &[String],
    metrics: &HashMap<String, ActivityMetrics>,
) -> Vec<String> {
    rank(participants, metrics).into_iter().map(|r| r.id).collect()
}
