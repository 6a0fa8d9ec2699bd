//! Blended ranking signal for search results.
//!
//! Combines the raw relevance score a search backend returns with a recency
//! decay and the graph-derived referrer score, using configurable weights.
//! The query layer sits outside this crate; it calls [`blended_score`] per
//! hit before final ordering.

use chrono::{DateTime, Utc};

use crate::config::ScoringConfig;

/// Exponential recency factor in `(0, 1]`: 1.0 for a document updated now,
/// 0.5 at one half-life, approaching 0 for stale documents. Documents with
/// no source timestamp get 0.
pub fn recency_factor(
    source_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let Some(updated) = source_updated_at else {
        return 0.0;
    };
    if half_life_days <= 0.0 {
        return 0.0;
    }
    let age_days = (now - updated).num_seconds().max(0) as f64 / 86_400.0;
    (-std::f64::consts::LN_2 * age_days / half_life_days).exp()
}

/// Blend relevance, recency, and referrer authority into one ranking score.
pub fn blended_score(
    relevance: f64,
    referrer_score: f64,
    source_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ScoringConfig,
) -> f64 {
    config.relevance_weight * relevance
        + config.recency_weight * recency_factor(source_updated_at, now, config.recency_half_life_days)
        + config.referrer_weight * referrer_score
}
