use crate::models::{FacetKind, Item, UserProfile};
use crate::utils::sort_scored;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const CATEGORY_WEIGHT: f64 = 0.30;
pub const AGE_WEIGHT: f64 = 0.15;
pub const RELATIONSHIP_WEIGHT: f64 = 0.10;
pub const GENDER_WEIGHT: f64 = 0.10;
pub const PLATFORM_WEIGHT: f64 = 0.10;
pub const PRICE_WEIGHT: f64 = 0.15;
pub const RECENCY_WEIGHT: f64 = 0.10;

const RECENCY_HORIZON_DAYS: f64 = 365.0;

/// How close `price` sits to the user's average, in [0, 1].
pub fn price_closeness(price: Option<f64>, avg_price: Option<f64>) -> f64 {
    match (price, avg_price) {
        (Some(price), Some(avg)) if price > 0.0 && avg > 0.0 => (1.0 - (price - avg).abs() / avg).max(0.0),
        _ => 0.0,
    }
}

/// Linear freshness decay over a year.
pub fn recency(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / RECENCY_HORIZON_DAYS).max(0.0)
}

pub fn score_item(profile: &UserProfile, item: &Item, now: DateTime<Utc>) -> f64 {
    let facet = |kind: FacetKind| item.facets.get(&kind).unwrap_or_default();

    let score = CATEGORY_WEIGHT * profile.category_preferences.probability(facet(FacetKind::Category))
        + AGE_WEIGHT * profile.target_age_preferences.probability(facet(FacetKind::Age))
        + RELATIONSHIP_WEIGHT * profile.relationship_preferences.probability(facet(FacetKind::SuitableFor))
        + GENDER_WEIGHT * profile.gender_target_preferences.probability(facet(FacetKind::Gender))
        + PLATFORM_WEIGHT * profile.platform_preferences.probability(item.platform.as_deref().unwrap_or_default())
        + PRICE_WEIGHT * price_closeness(item.price, profile.avg_price)
        + RECENCY_WEIGHT * recency(item.created_at, now);

    score.min(1.0)
}

/// Scores candidates against the profile, keeping those strictly above `min_score`.
pub fn rank_candidates(
    profile: &UserProfile,
    candidates: &[Item],
    min_score: f64,
    now: DateTime<Utc>,
) -> Vec<(Uuid, f64)> {
    let mut scored: Vec<(Uuid, f64)> = candidates
        .iter()
        .map(|item| (item.item_id, score_item(profile, item, now)))
        .filter(|(_, score)| *score > min_score)
        .collect();
    sort_scored(&mut scored);
    scored
}

/// Candidate pool size for a page that needs `needed` items.
pub fn candidate_pool_size(needed: usize, max: usize) -> usize {
    needed.saturating_mul(3).clamp(100, max.max(100))
}
