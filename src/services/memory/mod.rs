//! In-process stores backing tests, benches and local runs without Postgres.

use crate::error::Result;
use crate::models::*;
use crate::services::derived_store::DerivedStore;
use crate::services::interaction_store::InteractionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryInteractionStore {
    items: RwLock<HashMap<Uuid, Item>>,
    interactions: RwLock<Vec<Interaction>>,
}

impl MemoryInteractionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: Item) {
        self.items.write().insert(item.item_id, item);
    }

    pub fn add_interaction(&self, interaction: Interaction) {
        self.interactions.write().push(interaction);
    }

    pub fn add_like(&self, user_id: Uuid, item_id: Uuid, at: DateTime<Utc>) {
        self.add_interaction(Interaction::like(user_id, item_id, at));
    }

    pub fn add_click(&self, user_id: Uuid, item_id: Uuid, at: DateTime<Utc>) {
        self.add_interaction(Interaction::click(user_id, item_id, at));
    }

    fn of_kind(&self, kind: InteractionKind, since: Option<DateTime<Utc>>) -> Vec<Interaction> {
        self.interactions
            .read()
            .iter()
            .filter(|i| i.kind == kind && since.map_or(true, |s| i.timestamp > s))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InteractionStore for MemoryInteractionStore {
    async fn liked_item_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let mut seen = HashSet::new();
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| i.kind == InteractionKind::Like && i.user_id == user_id)
            .filter(|i| seen.insert(i.item_id))
            .map(|i| i.item_id)
            .collect())
    }

    async fn likes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>> {
        Ok(self.of_kind(InteractionKind::Like, since))
    }

    async fn clicks(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Interaction>> {
        Ok(self.of_kind(InteractionKind::Click, since))
    }

    async fn eligible_items(&self) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self.items.read().values().filter(|i| i.is_eligible()).cloned().collect();
        items.sort_by_key(|i| i.item_id);
        Ok(items)
    }

    async fn recent_likers(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let mut latest: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for like in self.of_kind(InteractionKind::Like, since) {
            let entry = latest.entry(like.user_id).or_insert(like.timestamp);
            if like.timestamp > *entry {
                *entry = like.timestamp;
            }
        }

        let mut users: Vec<(Uuid, DateTime<Utc>)> = latest.into_iter().collect();
        users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        users.truncate(limit.unwrap_or(usize::MAX));
        Ok(users)
    }

    async fn like_history(&self, user_id: Uuid, limit: usize) -> Result<Vec<LikedItem>> {
        let items = self.items.read();
        let mut history: Vec<LikedItem> = self
            .interactions
            .read()
            .iter()
            .filter(|i| i.kind == InteractionKind::Like && i.user_id == user_id)
            .filter_map(|i| {
                items
                    .get(&i.item_id)
                    .map(|item| LikedItem { item: item.clone(), liked_at: i.timestamp })
            })
            .collect();

        history.sort_by(|a, b| b.liked_at.cmp(&a.liked_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn candidate_items(
        &self,
        geo_id: GeoId,
        exclude: &HashSet<Uuid>,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let mut candidates: Vec<Item> = self
            .items
            .read()
            .values()
            .filter(|i| i.is_eligible() && i.geo_id == geo_id && !exclude.contains(&i.item_id))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.item_id.cmp(&b.item_id)));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn filter_items(&self, candidates: &[Uuid], geo_id: GeoId, filters: &Filters) -> Result<Vec<Uuid>> {
        let items = self.items.read();
        Ok(candidates
            .iter()
            .filter(|id| items.get(id).is_some_and(|item| item.matches(geo_id, filters)))
            .copied()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDerivedStore {
    similarities: RwLock<BTreeMap<(Uuid, Uuid), ItemSimilarity>>,
    popular: RwLock<BTreeMap<(Segment, Uuid), PopularItem>>,
    profiles: RwLock<HashMap<Uuid, UserProfile>>,
}

impl MemoryDerivedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn similarity_rows(&self) -> Vec<ItemSimilarity> {
        self.similarities.read().values().cloned().collect()
    }

    /// Stored popularity rows in (segment, item) order.
    pub fn popular_rows(&self) -> Vec<PopularItem> {
        self.popular.read().values().cloned().collect()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.read().len()
    }
}

#[async_trait]
impl DerivedStore for MemoryDerivedStore {
    async fn profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().get(&user_id).cloned())
    }

    async fn profile_watermarks(&self, users: &[Uuid]) -> Result<HashMap<Uuid, DateTime<Utc>>> {
        let profiles = self.profiles.read();
        Ok(users
            .iter()
            .filter_map(|user| profiles.get(user).map(|p| (*user, p.updated_at)))
            .collect())
    }

    async fn similar_items(&self, items: &[Uuid], limit: usize) -> Result<Vec<ItemSimilarity>> {
        let items: HashSet<&Uuid> = items.iter().collect();
        let mut rows: Vec<ItemSimilarity> = self
            .similarities
            .read()
            .values()
            .filter(|row| items.contains(&row.item_a) || items.contains(&row.item_b))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| (a.item_a, a.item_b).cmp(&(b.item_a, b.item_b)))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn popular_items(&self, query: &PopularQuery) -> Result<Vec<Uuid>> {
        let mut best: HashMap<Uuid, f64> = HashMap::new();
        for row in self.popular.read().values() {
            if !query.admits(&row.segment) {
                continue;
            }
            let score = best.entry(row.item_id).or_insert(row.popularity_score);
            *score = score.max(row.popularity_score);
        }

        let mut ranked: Vec<(Uuid, f64)> = best.into_iter().collect();
        crate::utils::sort_scored(&mut ranked);
        Ok(ranked.into_iter().take(query.limit).map(|(id, _)| id).collect())
    }

    async fn delete_all_similarities(&self) -> Result<u64> {
        let mut rows = self.similarities.write();
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }

    async fn delete_similarities_touching(&self, items: &[Uuid]) -> Result<u64> {
        let items: HashSet<&Uuid> = items.iter().collect();
        let mut rows = self.similarities.write();
        let before = rows.len();
        rows.retain(|(a, b), _| !items.contains(a) && !items.contains(b));
        Ok((before - rows.len()) as u64)
    }

    async fn insert_similarities(&self, rows: &[ItemSimilarity]) -> Result<u64> {
        let mut stored = self.similarities.write();
        for row in rows {
            stored.insert((row.item_a, row.item_b), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn delete_popular_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.popular.write();
        let before = rows.len();
        rows.retain(|_, row| row.updated_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_all_popular(&self) -> Result<u64> {
        let mut rows = self.popular.write();
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }

    async fn insert_popular_items(&self, rows: &[PopularItem]) -> Result<u64> {
        let mut stored = self.popular.write();
        let mut inserted = 0;
        for row in rows {
            let key = (row.segment.clone(), row.item_id);
            if !stored.contains_key(&key) {
                stored.insert(key, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        self.profiles.write().insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn delete_all_profiles(&self) -> Result<u64> {
        let mut profiles = self.profiles.write();
        let removed = profiles.len() as u64;
        profiles.clear();
        Ok(removed)
    }
}
