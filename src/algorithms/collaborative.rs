use crate::models::ItemSimilarity;
use crate::utils::sort_scored;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Accumulates neighbor scores across every liked item a similarity row touches.
///
/// Liked items never come back as neighbors. The result is best-first, ties
/// broken by item id.
pub fn accumulate_neighbors(liked: &HashSet<Uuid>, rows: &[ItemSimilarity]) -> Vec<(Uuid, f64)> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();

    for row in rows {
        for (source, neighbor) in [(row.item_a, row.item_b), (row.item_b, row.item_a)] {
            if liked.contains(&source) && !liked.contains(&neighbor) {
                *scores.entry(neighbor).or_insert(0.0) += row.score;
            }
        }
    }

    let mut ranked: Vec<(Uuid, f64)> = scores.into_iter().collect();
    sort_scored(&mut ranked);
    ranked
}
