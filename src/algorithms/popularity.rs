use crate::models::{Interaction, InteractionKind, Item, PopularItem, Segment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopularityMode {
    /// Recent window, weights decay with interaction age.
    Decayed,
    /// All-time flat weights, used when bootstrapping the derived store.
    FullSync,
}

/// Contribution of a single interaction observed at `at`.
pub fn interaction_weight(
    kind: InteractionKind,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    mode: PopularityMode,
) -> f64 {
    match mode {
        PopularityMode::FullSync => match kind {
            InteractionKind::Like => 3.0,
            InteractionKind::Click => 1.0,
        },
        PopularityMode::Decayed => {
            let age_days = (now - at).num_days();
            match (kind, age_days) {
                (InteractionKind::Like, d) if d <= 7 => 5.0,
                (InteractionKind::Like, d) if d <= 30 => 3.0,
                (InteractionKind::Like, _) => 1.5,
                (InteractionKind::Click, d) if d <= 7 => 3.0,
                (InteractionKind::Click, d) if d <= 30 => 2.0,
                (InteractionKind::Click, _) => 1.0,
            }
        }
    }
}

/// Sums weighted interactions per item. Items that never score positive are absent.
pub fn score_items(
    interactions: &[Interaction],
    now: DateTime<Utc>,
    mode: PopularityMode,
) -> HashMap<Uuid, f64> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    for interaction in interactions {
        *scores.entry(interaction.item_id).or_insert(0.0) +=
            interaction_weight(interaction.kind, interaction.timestamp, now, mode);
    }
    scores.retain(|_, score| *score > 0.0);
    scores
}

/// One row per scored eligible item, in the item's own segment with "any"
/// standing in for missing facets. Looser lookups release axes at query time.
/// Rows come back best-first, capped at `limit`.
pub fn build_popular_rows(
    items: &[Item],
    scores: &HashMap<Uuid, f64>,
    limit: usize,
    now: DateTime<Utc>,
) -> Vec<PopularItem> {
    let mut ranked: Vec<(&Item, f64)> = items
        .iter()
        .filter(|item| item.is_eligible())
        .filter_map(|item| scores.get(&item.item_id).map(|score| (item, *score)))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.item_id.cmp(&b.0.item_id))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|(item, popularity_score)| PopularItem {
            segment: Segment::for_item(item),
            item_id: item.item_id,
            popularity_score,
            updated_at: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FacetKind, Facets, StockStatus};
    use chrono::Duration;

    fn item(n: u128, facets: Facets) -> Item {
        Item {
            item_id: Uuid::from_u128(n),
            geo_id: 213,
            facets,
            price: Some(100.0),
            platform: None,
            stock_status: StockStatus::InStock,
            owner_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_decayed_weights_by_age() {
        let now = Utc::now();
        let w = |kind, days| interaction_weight(kind, now - Duration::days(days), now, PopularityMode::Decayed);
        assert_eq!(w(InteractionKind::Like, 1), 5.0);
        assert_eq!(w(InteractionKind::Like, 20), 3.0);
        assert_eq!(w(InteractionKind::Like, 60), 1.5);
        assert_eq!(w(InteractionKind::Click, 7), 3.0);
        assert_eq!(w(InteractionKind::Click, 30), 2.0);
        assert_eq!(w(InteractionKind::Click, 89), 1.0);
    }

    #[test]
    fn test_full_sync_weights_ignore_age() {
        let now = Utc::now();
        let old = now - Duration::days(1000);
        assert_eq!(interaction_weight(InteractionKind::Like, old, now, PopularityMode::FullSync), 3.0);
        assert_eq!(interaction_weight(InteractionKind::Click, now, now, PopularityMode::FullSync), 1.0);
    }

    #[test]
    fn test_rows_use_own_segment_best_first() {
        let now = Utc::now();
        let items = vec![
            item(1, Facets::new().with(FacetKind::Gender, "f").with(FacetKind::Category, "books")),
            item(2, Facets::new()),
            item(3, Facets::new().with(FacetKind::Age, "18-24")),
        ];
        let user = Uuid::from_u128(99);
        let interactions = vec![
            Interaction::like(user, items[0].item_id, now),
            Interaction::click(user, items[1].item_id, now),
            Interaction::like(user, items[2].item_id, now),
            Interaction::like(Uuid::from_u128(98), items[2].item_id, now),
        ];
        let scores = score_items(&interactions, now, PopularityMode::Decayed);
        let rows = build_popular_rows(&items, &scores, 100, now);

        let order: Vec<u128> = rows.iter().map(|r| r.item_id.as_u128()).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(rows[0].segment.age_group, "18-24");
        assert_eq!(rows[1].segment.gender, "f");
        assert_eq!(rows[1].segment.category, "books");
        assert!(rows[2].segment.is_generic());

        assert_eq!(build_popular_rows(&items, &scores, 2, now).len(), 2);
    }

    #[test]
    fn test_ineligible_items_are_skipped() {
        let now = Utc::now();
        let mut private = item(1, Facets::new());
        private.owner_id = Some(Uuid::from_u128(7));
        let scores: HashMap<Uuid, f64> = [(private.item_id, 10.0)].into_iter().collect();
        assert!(build_popular_rows(&[private], &scores, 100, now).is_empty());
    }
}
