use crate::models::{Interaction, InteractionKind, ItemSimilarity};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityThresholds {
    pub min_co_occurrence: u32,
    pub min_score: f64,
    pub max_rows: usize,
}

/// Jaccard index over two liker sets, given their sizes and overlap.
pub fn jaccard(co_occurrence: u32, likes_a: u32, likes_b: u32) -> f64 {
    let union = (likes_a + likes_b).saturating_sub(co_occurrence);
    if union == 0 {
        0.0
    } else {
        co_occurrence as f64 / union as f64
    }
}

type PairCounts = HashMap<(Uuid, Uuid), u32>;

fn merge_counts(mut into: PairCounts, from: PairCounts) -> PairCounts {
    if into.len() < from.len() {
        return merge_counts(from, into);
    }
    for (pair, count) in from {
        *into.entry(pair).or_insert(0) += count;
    }
    into
}

/// Computes item-item similarities from the given likes.
///
/// When `touched` is set, only pairs with at least one touched member are
/// produced; liker counts still come from the full like set so scores match a
/// full rebuild.
pub fn compute_similarities(
    likes: &[Interaction],
    touched: Option<&HashSet<Uuid>>,
    thresholds: &SimilarityThresholds,
    now: DateTime<Utc>,
) -> Vec<ItemSimilarity> {
    let mut by_user: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
    for like in likes.iter().filter(|i| i.kind == InteractionKind::Like) {
        by_user.entry(like.user_id).or_default().insert(like.item_id);
    }

    let mut likes_per_item: HashMap<Uuid, u32> = HashMap::new();
    for items in by_user.values() {
        for item in items {
            *likes_per_item.entry(*item).or_insert(0) += 1;
        }
    }

    let baskets: Vec<Vec<Uuid>> = by_user
        .into_values()
        .filter(|items| items.len() > 1)
        .map(|items| items.into_iter().collect())
        .collect();

    // Baskets are sorted, so (items[i], items[j]) with i < j is already canonical.
    let co_counts = baskets
        .par_iter()
        .fold(PairCounts::new, |mut acc, items| {
            for (i, a) in items.iter().enumerate() {
                for b in &items[i + 1..] {
                    if let Some(touched) = touched {
                        if !touched.contains(a) && !touched.contains(b) {
                            continue;
                        }
                    }
                    *acc.entry((*a, *b)).or_insert(0) += 1;
                }
            }
            acc
        })
        .reduce(PairCounts::new, merge_counts);

    let mut rows: Vec<ItemSimilarity> = co_counts
        .into_iter()
        .filter(|(_, co)| *co >= thresholds.min_co_occurrence)
        .filter_map(|((item_a, item_b), co)| {
            let total_likes_a = likes_per_item.get(&item_a).copied().unwrap_or(0);
            let total_likes_b = likes_per_item.get(&item_b).copied().unwrap_or(0);
            let score = jaccard(co, total_likes_a, total_likes_b);
            (score >= thresholds.min_score).then_some(ItemSimilarity {
                item_a,
                item_b,
                score,
                co_occurrence_count: co,
                total_likes_a,
                total_likes_b,
                updated_at: now,
            })
        })
        .collect();

    rows.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| (x.item_a, x.item_b).cmp(&(y.item_a, y.item_b)))
    });
    rows.truncate(thresholds.max_rows);
    rows
}
