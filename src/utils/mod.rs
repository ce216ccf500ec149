use crate::models::{PageInfo, Pagination};
use std::cmp::Ordering;
use std::collections::HashSet;
use uuid::Uuid;

pub mod validation;

/// Sorts scored items best-first; equal scores fall back to id order so runs
/// over the same data always rank identically.
pub fn sort_scored(scored: &mut [(Uuid, f64)]) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

/// Drops repeated ids, keeping the first occurrence.
pub fn dedup_preserving_order(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Slices one page out of an already-filtered list.
pub fn paginate(items: &[Uuid], pagination: &Pagination) -> (Vec<Uuid>, PageInfo) {
    let total_count = items.len();
    let page_size = pagination.page_size.max(1);
    let total_pages = total_count.div_ceil(page_size);

    let start = pagination.offset().min(total_count);
    let end = (start + page_size).min(total_count);

    let info = PageInfo {
        page: pagination.page,
        page_size,
        total_count,
        total_pages,
        has_next: pagination.page < total_pages,
        has_previous: pagination.page > 1,
    };

    (items[start..end].to_vec(), info)
}
