use crate::config::Config;
use crate::error::Result;
use crate::models::*;
use crate::services::cache::{CacheGate, CachedPage};
use crate::services::recommendation::{Recommendation, TieredRecommender};
use crate::utils::{dedup_preserving_order, paginate, validation};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// The two serving operations: demographic popularity and personalized
/// recommendations, both read through the page cache.
pub struct ServingService {
    recommender: Arc<TieredRecommender>,
    cache: Arc<CacheGate>,
    config: Arc<Config>,
    serving_stats: Arc<DashMap<String, u64>>,
}

impl ServingService {
    pub fn new(recommender: Arc<TieredRecommender>, cache: Arc<CacheGate>, config: Arc<Config>) -> Self {
        Self {
            recommender,
            cache,
            config,
            serving_stats: Arc::new(DashMap::new()),
        }
    }

    pub async fn popular_items(&self, request: PopularItemsRequest) -> Result<RecommendationResponse> {
        validation::validate_popular_request(&request, &self.config.recommendation)?;
        self.increment_stat("popular_requests");

        // Remember whatever the client told us about this user for later
        // personalized fallbacks.
        let demographics = request.demographics();
        if let Some(user_id) = request.user_id {
            if !demographics.is_empty() {
                self.cache.put_demographics(user_id, &demographics).await;
            }
        }

        let key = self.cache.popular_key(&request);
        let ttl = self.cache.popular_ttl();
        self.serve(&key, ttl, &request.pagination, || self.recommender.popular(&request, &demographics))
            .await
    }

    pub async fn personalized_items(&self, request: PersonalizedRequest) -> Result<RecommendationResponse> {
        validation::validate_personalized_request(&request, &self.config.recommendation)?;
        self.increment_stat("personalized_requests");

        let key = self.cache.personalized_key(&request);
        let ttl = self.cache.personalized_ttl();
        let demographics = self.cache.demographics(request.user_id).await;
        self.serve(&key, ttl, &request.pagination, || self.recommender.personalized(&request, &demographics))
            .await
    }

    async fn serve<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        pagination: &Pagination,
        compute: F,
    ) -> Result<RecommendationResponse>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Recommendation>>,
    {
        self.increment_stat("total_requests");
        let started = Instant::now();

        if let Some(page) = self.cache.get_page(key).await {
            self.increment_stat("cache_hits");
            return Ok(self.respond(page, true, started));
        }
        self.increment_stat("cache_misses");

        let recommendation = match compute().await {
            Ok(recommendation) => recommendation,
            Err(e) => {
                self.increment_stat("failed_requests");
                error!(key, error = %e, "Failed to compute recommendations");
                return Err(e);
            }
        };

        let items = dedup_preserving_order(recommendation.items);
        let (page_items, info) = paginate(&items, pagination);
        let page = CachedPage {
            items: page_items,
            pagination: info,
            algorithm: recommendation.algorithm.label(),
        };
        self.cache.put_page(key, &page, ttl).await;

        let response = self.respond(page, false, started);
        info!(
            key,
            algorithm = %response.algorithm_used,
            items = response.items.len(),
            total = response.pagination.total_count,
            elapsed_ms = response.computation_time_ms,
            "Served recommendations"
        );
        Ok(response)
    }

    fn respond(&self, page: CachedPage, cache_hit: bool, started: Instant) -> RecommendationResponse {
        let elapsed = started.elapsed();
        self.update_latency_stat(elapsed.as_millis() as u64);

        RecommendationResponse {
            items: page.items,
            pagination: page.pagination,
            algorithm_used: page.algorithm,
            cache_hit,
            computation_time_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    pub fn get_serving_stats(&self) -> HashMap<String, u64> {
        self.serving_stats.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }

    fn increment_stat(&self, key: &str) {
        let mut counter = self.serving_stats.entry(key.to_string()).or_insert(0);
        *counter += 1;
    }

    fn update_latency_stat(&self, latency_ms: u64) {
        let served = {
            let mut counter = self.serving_stats.entry("served_responses".to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        // Running average over every served response.
        let current_avg = self.serving_stats.get("avg_latency_ms").map(|v| *v).unwrap_or(0);
        let new_avg = (current_avg * (served - 1) + latency_ms) / served;
        self.serving_stats.insert("avg_latency_ms".to_string(), new_avg);

        let current_max = self.serving_stats.get("max_latency_ms").map(|v| *v).unwrap_or(0);
        if latency_ms > current_max {
            self.serving_stats.insert("max_latency_ms".to_string(), latency_ms);
        }
    }
}
