use crate::models::{Distribution, FacetKind, LikedItem, UserProfile};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
struct PreferenceCounts {
    category: HashMap<String, u32>,
    platform: HashMap<String, u32>,
    target_age: HashMap<String, u32>,
    relationship: HashMap<String, u32>,
    gender_target: HashMap<String, u32>,
}

impl PreferenceCounts {
    fn observe(map: &mut HashMap<String, u32>, value: Option<&str>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            *map.entry(value.to_string()).or_insert(0) += 1;
        }
    }
}

/// Builds a preference profile from a most-recent-first slice of likes.
///
/// Returns `None` for an empty history: users without likes have no profile.
pub fn build_profile(user_id: Uuid, history: &[LikedItem], now: DateTime<Utc>) -> Option<UserProfile> {
    if history.is_empty() {
        return None;
    }

    let mut counts = PreferenceCounts::default();
    let mut prices = Vec::new();

    for liked in history {
        let facets = &liked.item.facets;
        PreferenceCounts::observe(&mut counts.category, facets.get(&FacetKind::Category));
        PreferenceCounts::observe(&mut counts.target_age, facets.get(&FacetKind::Age));
        PreferenceCounts::observe(&mut counts.relationship, facets.get(&FacetKind::SuitableFor));
        PreferenceCounts::observe(&mut counts.gender_target, facets.get(&FacetKind::Gender));
        PreferenceCounts::observe(&mut counts.platform, liked.item.platform.as_deref());

        if let Some(price) = liked.item.price.filter(|p| p.is_finite() && *p > 0.0) {
            prices.push(price);
        }
    }

    let (price_min, price_max, avg_price) = if prices.is_empty() {
        (None, None, None)
    } else {
        let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
        let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = prices.iter().sum::<f64>() / prices.len() as f64;
        (Some(min), Some(max), Some(avg))
    };

    Some(UserProfile {
        user_id,
        category_preferences: Distribution::from_counts(&counts.category),
        platform_preferences: Distribution::from_counts(&counts.platform),
        target_age_preferences: Distribution::from_counts(&counts.target_age),
        relationship_preferences: Distribution::from_counts(&counts.relationship),
        gender_target_preferences: Distribution::from_counts(&counts.gender_target),
        avg_price,
        price_min,
        price_max,
        interaction_count: history.len() as u32,
        last_interaction_at: history.iter().map(|l| l.liked_at).max(),
        updated_at: now,
    })
}
