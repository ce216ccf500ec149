//! Read-through page cache. Backend failures never fail a request: the gate
//! logs them and reports a miss.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// A missing key is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn flush_all(&self) -> Result<()>;
}

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_async_connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("FLUSHDB").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Process-local backend with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .and_then(|entry| (entry.1 > now).then(|| entry.0.clone()));
        if value.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Builds cache keys. Filters are rendered in a fixed order so equal requests
/// map to equal keys.
pub struct CacheKey;

impl CacheKey {
    pub fn popular(prefix: &str, request: &PopularItemsRequest) -> String {
        let mut key = format!(
            "{}:popular:{}:{}:{}:{}:{}:{}",
            prefix,
            request.geo_id,
            request.gender.as_deref().unwrap_or(Segment::ANY),
            request.age.as_deref().unwrap_or(Segment::ANY),
            request.category.as_deref().unwrap_or(Segment::ANY),
            request.pagination.page,
            request.pagination.page_size,
        );
        Self::push_filters(&mut key, &request.filters);
        key
    }

    pub fn personalized(prefix: &str, request: &PersonalizedRequest) -> String {
        let mut key = format!(
            "{}:personalized:{}:{}:{}:{}",
            prefix, request.user_id, request.geo_id, request.pagination.page, request.pagination.page_size,
        );
        Self::push_filters(&mut key, &request.filters);
        key
    }

    pub fn demographics(prefix: &str, user_id: Uuid) -> String {
        format!("{}:user_demographics:{}", prefix, user_id)
    }

    fn push_filters(key: &mut String, filters: &Filters) {
        if let Some(from) = filters.price_from {
            key.push_str(&format!(":pf{}", from));
        }
        if let Some(to) = filters.price_to {
            key.push_str(&format!(":pt{}", to));
        }
        if let Some(ref platform) = filters.platform {
            key.push_str(&format!(":pl{}", platform));
        }
        for (kind, value) in &filters.facets {
            key.push_str(&format!(":{}={}", kind, value));
        }
    }
}

/// What a cached response page stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPage {
    pub items: Vec<Uuid>,
    pub pagination: PageInfo,
    pub algorithm: String,
}

pub struct CacheGate {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheGate {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn popular_key(&self, request: &PopularItemsRequest) -> String {
        CacheKey::popular(&self.config.key_prefix, request)
    }

    pub fn personalized_key(&self, request: &PersonalizedRequest) -> String {
        CacheKey::personalized(&self.config.key_prefix, request)
    }

    pub fn popular_ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_popular_secs)
    }

    pub fn personalized_ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_personalized_secs)
    }

    async fn read<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        if let Err(e) = self.backend.set_ex(key, &payload, ttl).await {
            warn!(key, error = %e, "Cache write failed, skipping");
        } else {
            debug!(key, ttl_secs = ttl.as_secs(), "Cached entry");
        }
    }

    pub async fn get_page(&self, key: &str) -> Option<CachedPage> {
        self.read(key).await
    }

    pub async fn put_page(&self, key: &str, page: &CachedPage, ttl: Duration) {
        self.write(key, page, ttl).await
    }

    /// Hints last seen for the user; empty when none are cached.
    pub async fn demographics(&self, user_id: Uuid) -> Demographics {
        let key = CacheKey::demographics(&self.config.key_prefix, user_id);
        self.read(&key).await.unwrap_or_default()
    }

    pub async fn put_demographics(&self, user_id: Uuid, demographics: &Demographics) {
        let key = CacheKey::demographics(&self.config.key_prefix, user_id);
        let ttl = Duration::from_secs(self.config.ttl_demographics_secs);
        self.write(&key, demographics, ttl).await
    }

    /// Drops every entry of the backend.
    pub async fn flush(&self) {
        if let Err(e) = self.backend.flush_all().await {
            warn!(error = %e, "Cache flush failed");
        }
    }
}
