use crate::algorithms::collaborative::accumulate_neighbors;
use crate::algorithms::content::{candidate_pool_size, rank_candidates};
use crate::config::RecommendationConfig;
use crate::error::Result;
use crate::models::*;
use crate::services::derived_store::DerivedStore;
use crate::services::interaction_store::InteractionStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Which algorithm a user qualifies for, from how much they have interacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTier {
    New,
    Light,
    Established,
}

impl UserTier {
    pub fn from_interactions(count: u32, collaborative_min: u32) -> Self {
        match count {
            0 => Self::New,
            n if n < collaborative_min => Self::Light,
            _ => Self::Established,
        }
    }
}

/// A ranked, already filtered candidate list and the algorithm that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub items: Vec<Uuid>,
    pub algorithm: Algorithm,
}

fn known(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "unknown" && *v != Segment::ANY)
}

/// The popularity tiers to try, tightest first, as (tier, gender, age)
/// constraints. A `None` axis is released.
pub fn popularity_chain(demographics: &Demographics) -> Vec<(PopularityTier, Option<String>, Option<String>)> {
    let gender = known(demographics.gender.as_deref()).map(str::to_string);
    let age = known(demographics.age.as_deref()).map(str::to_string);

    let mut chain = Vec::with_capacity(4);
    if gender.is_some() && age.is_some() {
        chain.push((PopularityTier::Exact, gender.clone(), age.clone()));
    }
    if gender.is_some() {
        chain.push((PopularityTier::Gender, gender, None));
    }
    if age.is_some() {
        chain.push((PopularityTier::Age, None, age));
    }
    chain.push((PopularityTier::Generic, None, None));
    chain
}

pub struct TieredRecommender {
    interactions: Arc<dyn InteractionStore>,
    derived: Arc<dyn DerivedStore>,
    config: RecommendationConfig,
}

impl TieredRecommender {
    pub fn new(
        interactions: Arc<dyn InteractionStore>,
        derived: Arc<dyn DerivedStore>,
        config: RecommendationConfig,
    ) -> Self {
        Self { interactions, derived, config }
    }

    /// Walks the popularity chain and stops at the first tier that still has
    /// items after exclusions and live filtering. Ends at the generic tier,
    /// possibly empty.
    pub async fn popular_chain(
        &self,
        geo_id: GeoId,
        demographics: &Demographics,
        category: Option<&str>,
        filters: &Filters,
        exclude: &HashSet<Uuid>,
        needed: usize,
    ) -> Result<(Vec<Uuid>, PopularityTier)> {
        let limit = self.config.popular_candidate_limit.max(needed) + exclude.len();

        for (tier, gender, age_group) in popularity_chain(demographics) {
            let query = PopularQuery {
                geo_id,
                gender,
                age_group,
                category: known(category).map(str::to_string),
                limit,
            };
            let ranked: Vec<Uuid> = self
                .derived
                .popular_items(&query)
                .await?
                .into_iter()
                .filter(|id| !exclude.contains(id))
                .collect();
            if ranked.is_empty() {
                debug!(geo_id, tier = tier.as_str(), "Popularity tier empty");
                continue;
            }

            let live = self.interactions.filter_items(&ranked, geo_id, filters).await?;
            if !live.is_empty() {
                return Ok((live, tier));
            }
        }

        Ok((Vec::new(), PopularityTier::Generic))
    }

    pub async fn popular(&self, request: &PopularItemsRequest, demographics: &Demographics) -> Result<Recommendation> {
        let (items, tier) = self
            .popular_chain(
                request.geo_id,
                demographics,
                request.category.as_deref(),
                &request.filters,
                &HashSet::new(),
                request.pagination.end(),
            )
            .await?;

        Ok(Recommendation { items, algorithm: Algorithm::Popular(tier) })
    }

    pub async fn personalized(
        &self,
        request: &PersonalizedRequest,
        demographics: &Demographics,
    ) -> Result<Recommendation> {
        let profile = self.derived.profile(request.user_id).await?;
        let count = profile.as_ref().map_or(0, |p| p.interaction_count);
        let tier = UserTier::from_interactions(count, self.config.collaborative_min_interactions);
        let needed = request.pagination.end();

        let liked: HashSet<Uuid> = if tier == UserTier::New {
            HashSet::new()
        } else {
            self.interactions.liked_item_ids(request.user_id).await?.into_iter().collect()
        };
        debug!(user_id = %request.user_id, ?tier, liked = liked.len(), "Selecting recommendation tier");

        if tier == UserTier::Established {
            let items = self.collaborative(request, demographics, &liked, needed).await?;
            if !items.is_empty() {
                return Ok(Recommendation { items, algorithm: Algorithm::Collaborative });
            }
            debug!(user_id = %request.user_id, "No collaborative candidates, downgrading to content");
        }

        if let Some(profile) = profile.as_ref().filter(|_| tier != UserTier::New) {
            let items = self.content_based(request, profile, &liked, needed).await?;
            if !items.is_empty() {
                return Ok(Recommendation { items, algorithm: Algorithm::ContentBased });
            }
        }

        let (items, tier) = self
            .popular_chain(request.geo_id, demographics, None, &request.filters, &liked, needed)
            .await?;
        Ok(Recommendation { items, algorithm: Algorithm::PopularFallback(tier) })
    }

    /// Neighbors of the user's likes, topped up with popular items when they
    /// cannot fill the requested page.
    pub async fn collaborative(
        &self,
        request: &PersonalizedRequest,
        demographics: &Demographics,
        liked: &HashSet<Uuid>,
        needed: usize,
    ) -> Result<Vec<Uuid>> {
        if liked.is_empty() {
            return Ok(Vec::new());
        }

        let liked_ids: Vec<Uuid> = liked.iter().copied().collect();
        let rows = self.derived.similar_items(&liked_ids, self.config.neighbor_limit).await?;
        let ranked: Vec<Uuid> = accumulate_neighbors(liked, &rows).into_iter().map(|(id, _)| id).collect();
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = self.interactions.filter_items(&ranked, request.geo_id, &request.filters).await?;
        if items.is_empty() || items.len() >= needed {
            return Ok(items);
        }

        let mut exclude = liked.clone();
        exclude.extend(items.iter().copied());
        let (fill, tier) = self
            .popular_chain(request.geo_id, demographics, None, &request.filters, &exclude, needed)
            .await?;

        let missing = needed - items.len();
        debug!(
            user_id = %request.user_id,
            collaborative = items.len(),
            fill = fill.len().min(missing),
            tier = tier.as_str(),
            "Topping up collaborative results"
        );
        items.extend(fill.into_iter().take(missing));
        Ok(items)
    }

    pub async fn content_based(
        &self,
        request: &PersonalizedRequest,
        profile: &UserProfile,
        liked: &HashSet<Uuid>,
        needed: usize,
    ) -> Result<Vec<Uuid>> {
        let pool = candidate_pool_size(needed, self.config.content_candidate_limit);
        let candidates = self.interactions.candidate_items(request.geo_id, liked, pool).await?;
        let ranked: Vec<Uuid> = rank_candidates(profile, &candidates, self.config.min_content_score, Utc::now())
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        self.interactions.filter_items(&ranked, request.geo_id, &request.filters).await
    }
}
