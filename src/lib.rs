pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{RecError, Result};
pub use models::*;

use services::builders::{PopularityBuilder, ProfileBuilder, SimilarityBuilder};
use services::cache::{CacheBackend, CacheGate, RedisCache};
use services::derived_store::{DerivedStore, PgDerivedStore};
use services::interaction_store::{InteractionStore, PgInteractionStore};
use services::recommendation::TieredRecommender;
use services::serving::ServingService;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub interactions: Arc<dyn InteractionStore>,
    pub derived: Arc<dyn DerivedStore>,
    pub cache: Arc<CacheGate>,
    pub recommender: Arc<TieredRecommender>,
    pub serving: Arc<ServingService>,
}

async fn connect(name: &str, config: &config::PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;
    info!(pool = name, max_connections = config.max_connections, "Connected to Postgres");
    Ok(pool)
}

impl AppState {
    /// Connects both Postgres pools and Redis, and brings the derived schema up to date.
    pub async fn new(config: Config) -> Result<Self> {
        let main_pool = connect("main_db", &config.main_db).await?;
        let derived_pool = connect("derived_db", &config.derived_db).await?;

        let derived = PgDerivedStore::new(derived_pool);
        derived.migrate().await?;

        let cache = RedisCache::open(&config.redis.url)?;

        Ok(Self::from_stores(
            config,
            Arc::new(PgInteractionStore::new(main_pool)),
            Arc::new(derived),
            Arc::new(cache),
        ))
    }

    /// Wires the services over already constructed stores.
    pub fn from_stores(
        config: Config,
        interactions: Arc<dyn InteractionStore>,
        derived: Arc<dyn DerivedStore>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> Self {
        let config = Arc::new(config);

        let cache = Arc::new(CacheGate::new(cache_backend, config.cache.clone()));

        let recommender = Arc::new(TieredRecommender::new(
            interactions.clone(),
            derived.clone(),
            config.recommendation.clone(),
        ));

        let serving = Arc::new(ServingService::new(recommender.clone(), cache.clone(), config.clone()));

        Self {
            config,
            interactions,
            derived,
            cache,
            recommender,
            serving,
        }
    }

    pub fn similarity_builder(&self) -> SimilarityBuilder {
        SimilarityBuilder::new(self.interactions.clone(), self.derived.clone(), self.config.similarity.clone())
    }

    pub fn popularity_builder(&self) -> PopularityBuilder {
        PopularityBuilder::new(self.interactions.clone(), self.derived.clone(), self.config.popularity.clone())
    }

    pub fn profile_builder(&self) -> ProfileBuilder {
        ProfileBuilder::new(self.interactions.clone(), self.derived.clone(), self.config.profile.clone())
    }
}

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
