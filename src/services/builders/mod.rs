//! Offline builders that rebuild the derived store from raw interactions.

use crate::algorithms::popularity::{build_popular_rows, score_items, PopularityMode};
use crate::algorithms::profile::build_profile;
use crate::algorithms::similarity::{compute_similarities, SimilarityThresholds};
use crate::config::{PopularityConfig, ProfileConfig, SimilarityConfig};
use crate::error::Result;
use crate::services::cache::CacheGate;
use crate::services::derived_store::DerivedStore;
use crate::services::interaction_store::InteractionStore;
use crate::services::scheduler::Job;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub written: u64,
    pub skipped: u64,
}

impl BuildSummary {
    fn absorb(&mut self, other: BuildSummary) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Writes `rows` in batches. A failed batch is retried row by row and rows
/// that still fail are logged and skipped.
async fn write_in_batches<T, F, Fut>(rows: &[T], batch_size: usize, what: &str, insert: F) -> BuildSummary
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let mut summary = BuildSummary::default();

    for batch in rows.chunks(batch_size.max(1)) {
        match insert(batch.to_vec()).await {
            Ok(written) => summary.written += written,
            Err(e) => {
                warn!(what, batch_len = batch.len(), error = %e, "Batch insert failed, retrying row by row");
                for row in batch {
                    match insert(vec![row.clone()]).await {
                        Ok(written) => summary.written += written,
                        Err(e) => {
                            warn!(what, error = %e, "Skipping row that failed to insert");
                            summary.skipped += 1;
                        }
                    }
                }
            }
        }
    }

    summary
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMode {
    /// Recompute every pair and replace the whole relation.
    Full,
    /// Recompute only pairs touching recently liked items.
    Incremental,
}

pub struct SimilarityBuilder {
    interactions: Arc<dyn InteractionStore>,
    derived: Arc<dyn DerivedStore>,
    config: SimilarityConfig,
}

impl SimilarityBuilder {
    pub fn new(
        interactions: Arc<dyn InteractionStore>,
        derived: Arc<dyn DerivedStore>,
        config: SimilarityConfig,
    ) -> Self {
        Self { interactions, derived, config }
    }

    pub fn thresholds(&self, mode: SimilarityMode) -> SimilarityThresholds {
        match mode {
            SimilarityMode::Full => SimilarityThresholds {
                min_co_occurrence: self.config.full_min_co_occurrence,
                min_score: self.config.full_min_score,
                max_rows: self.config.max_rows,
            },
            SimilarityMode::Incremental => SimilarityThresholds {
                min_co_occurrence: self.config.incremental_min_co_occurrence,
                min_score: self.config.incremental_min_score,
                max_rows: self.config.max_rows,
            },
        }
    }

    pub async fn build(&self, mode: SimilarityMode) -> Result<BuildSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let likes = self.interactions.likes(None).await?;

        let touched: Option<HashSet<Uuid>> = match mode {
            SimilarityMode::Full => None,
            SimilarityMode::Incremental => {
                let since = now - Duration::days(self.config.incremental_window_days);
                let touched: HashSet<Uuid> =
                    likes.iter().filter(|l| l.timestamp > since).map(|l| l.item_id).collect();
                if touched.is_empty() {
                    info!("No recently liked items, similarities unchanged");
                    return Ok(BuildSummary::default());
                }
                Some(touched)
            }
        };

        let thresholds = self.thresholds(mode);
        let touched_for_compute = touched.clone();
        let rows = tokio::task::spawn_blocking(move || {
            compute_similarities(&likes, touched_for_compute.as_ref(), &thresholds, now)
        })
        .await?;

        let deleted = match &touched {
            None => self.derived.delete_all_similarities().await?,
            Some(touched) => {
                let touched: Vec<Uuid> = touched.iter().copied().collect();
                self.derived.delete_similarities_touching(&touched).await?
            }
        };
        debug!(deleted, "Cleared previous similarity rows");

        let derived = &self.derived;
        let summary = write_in_batches(&rows, self.config.insert_batch_size, "item_similarity", |batch| async move {
            derived.insert_similarities(&batch).await
        })
        .await;

        info!(
            ?mode,
            pairs = rows.len(),
            written = summary.written,
            skipped = summary.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Item similarities rebuilt"
        );
        Ok(summary)
    }
}

#[async_trait]
impl Job for SimilarityBuilder {
    fn name(&self) -> &'static str {
        "similarity"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.build(SimilarityMode::Incremental).await?;
        Ok(())
    }
}

pub struct PopularityBuilder {
    interactions: Arc<dyn InteractionStore>,
    derived: Arc<dyn DerivedStore>,
    config: PopularityConfig,
}

impl PopularityBuilder {
    pub fn new(
        interactions: Arc<dyn InteractionStore>,
        derived: Arc<dyn DerivedStore>,
        config: PopularityConfig,
    ) -> Self {
        Self { interactions, derived, config }
    }

    pub async fn build(&self, mode: PopularityMode) -> Result<BuildSummary> {
        let started = Instant::now();
        let now = Utc::now();

        let (since, limit) = match mode {
            PopularityMode::Decayed => {
                (Some(now - Duration::days(self.config.decay_window_days)), self.config.row_limit)
            }
            PopularityMode::FullSync => (None, self.config.full_row_limit),
        };

        let mut interactions = self.interactions.likes(since).await?;
        interactions.extend(self.interactions.clicks(since).await?);
        let items = self.interactions.eligible_items().await?;

        let scores = score_items(&interactions, now, mode);
        let rows = build_popular_rows(&items, &scores, limit, now);

        let deleted = match mode {
            PopularityMode::Decayed => {
                let cutoff = now - Duration::seconds(self.config.stale_after_secs);
                self.derived.delete_popular_older_than(cutoff).await?
            }
            PopularityMode::FullSync => self.derived.delete_all_popular().await?,
        };
        debug!(deleted, "Purged popularity rows");

        let derived = &self.derived;
        let summary = write_in_batches(&rows, self.config.insert_batch_size, "popular_item", |batch| async move {
            derived.insert_popular_items(&batch).await
        })
        .await;

        info!(
            ?mode,
            scored_items = scores.len(),
            rows = rows.len(),
            written = summary.written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Popular items refreshed"
        );
        Ok(summary)
    }
}

#[async_trait]
impl Job for PopularityBuilder {
    fn name(&self) -> &'static str {
        "popularity"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.build(PopularityMode::Decayed).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// Recent likers whose stored profile predates their latest like.
    Incremental,
    /// Every user with at least one like.
    FullSync,
}

pub struct ProfileBuilder {
    interactions: Arc<dyn InteractionStore>,
    derived: Arc<dyn DerivedStore>,
    config: ProfileConfig,
}

impl ProfileBuilder {
    pub fn new(
        interactions: Arc<dyn InteractionStore>,
        derived: Arc<dyn DerivedStore>,
        config: ProfileConfig,
    ) -> Self {
        Self { interactions, derived, config }
    }

    async fn stale_users(&self, mode: ProfileMode) -> Result<Vec<Uuid>> {
        match mode {
            ProfileMode::FullSync => {
                let likers = self.interactions.recent_likers(None, None).await?;
                Ok(likers.into_iter().map(|(user, _)| user).collect())
            }
            ProfileMode::Incremental => {
                let since = Utc::now() - Duration::days(self.config.recent_window_days);
                let likers = self.interactions.recent_likers(Some(since), Some(self.config.max_users)).await?;
                let ids: Vec<Uuid> = likers.iter().map(|(user, _)| *user).collect();
                let watermarks = self.derived.profile_watermarks(&ids).await?;

                Ok(likers
                    .into_iter()
                    .filter(|(user, latest_like)| watermarks.get(user).map_or(true, |updated| updated < latest_like))
                    .map(|(user, _)| user)
                    .collect())
            }
        }
    }

    /// Rebuilds one user's profile. Returns whether a profile was written.
    pub async fn refresh_user(&self, user_id: Uuid, history_limit: usize) -> Result<bool> {
        let history = self.interactions.like_history(user_id, history_limit).await?;
        match build_profile(user_id, &history, Utc::now()) {
            Some(profile) => {
                self.derived.upsert_profile(&profile).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn build(&self, mode: ProfileMode) -> Result<BuildSummary> {
        let started = Instant::now();
        let users = self.stale_users(mode).await?;
        if users.is_empty() {
            info!(?mode, "No user profiles need updating");
            return Ok(BuildSummary::default());
        }

        let history_limit = match mode {
            ProfileMode::Incremental => self.config.history_limit,
            ProfileMode::FullSync => self.config.full_history_limit,
        };

        let mut summary = BuildSummary::default();
        for batch in users.chunks(self.config.batch_size.max(1)) {
            let results =
                futures::future::join_all(batch.iter().map(|user| self.refresh_user(*user, history_limit))).await;

            let mut batch_summary = BuildSummary::default();
            for (user, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => batch_summary.written += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(user_id = %user, error = %e, "Failed to update user profile");
                        batch_summary.skipped += 1;
                    }
                }
            }
            summary.absorb(batch_summary);
        }

        info!(
            ?mode,
            users = users.len(),
            written = summary.written,
            skipped = summary.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "User profiles updated"
        );
        Ok(summary)
    }
}

#[async_trait]
impl Job for ProfileBuilder {
    fn name(&self) -> &'static str {
        "profiles"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.build(ProfileMode::Incremental).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub similarities: BuildSummary,
    pub popular_items: BuildSummary,
    pub profiles: BuildSummary,
}

/// Bootstraps the derived store from scratch and drops every cached page.
pub async fn run_full_sync(
    derived: &dyn DerivedStore,
    similarity: &SimilarityBuilder,
    popularity: &PopularityBuilder,
    profiles: &ProfileBuilder,
    cache: &CacheGate,
) -> Result<SyncReport> {
    let started = Instant::now();
    info!("Starting full sync");

    let similarities = similarity.build(SimilarityMode::Full).await?;

    let popular_cleared = derived.delete_all_popular().await?;
    let profiles_cleared = derived.delete_all_profiles().await?;
    info!(popular_cleared, profiles_cleared, "Cleared derived relations");

    let popular_items = popularity.build(PopularityMode::FullSync).await?;
    let profiles = profiles.build(ProfileMode::FullSync).await?;

    cache.flush().await;

    let report = SyncReport { similarities, popular_items, profiles };
    info!(?report, elapsed_ms = started.elapsed().as_millis() as u64, "Full sync completed");
    Ok(report)
}
