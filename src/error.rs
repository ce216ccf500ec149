use thiserror::Error;

/// Errors surfaced by the recommendation core.
///
/// Empty results are never errors: every tier resolves "nothing found" by
/// falling through to the next one.
#[derive(Debug, Error)]
pub enum RecError {
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cache backend error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RecError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Store errors are the only class that must fail a serving request.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, RecError>;
