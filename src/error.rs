use thiserror::Error;

/// Errors surfaced at the venue-adapter boundary. Mirrors the shape of the
/// teacher's hand-rolled `OrderError`: a closed set distinguishing transient
/// (retry-worthy) failures from terminal ones.
#[derive(Debug, Error, Clone)]
pub enum VenueError {
    #[error("network error: {0}")]
    Network(String),
    #[error("venue rejected order: {0}")]
    Rejected(String),
    #[error("order not found")]
    NotFound,
    #[error("invalid order parameters: {0}")]
    InvalidOrder(String),
    #[error("venue under maintenance")]
    Maintenance,
    #[error("rate limited, retry after {0}ms")]
    RateLimited(u64),
    #[error("auth error: {0}")]
    Auth(String),
}

impl VenueError {
    /// Whether a retrying wrapper should attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Network(_) | VenueError::RateLimited(_) | VenueError::Maintenance
        )
    }

    /// Cancel/close calls treat "already gone" as success (§4.1, §7).
    pub fn is_idempotent_success_on_cancel(&self) -> bool {
        matches!(self, VenueError::NotFound)
            || matches!(self, VenueError::Rejected(msg) if msg.to_lowercase().contains("already"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("missing key: {0}")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("validation failed: {0}")]
    Validation(String),
}
