//! Shared error taxonomy for the control plane (spec §7).
//!
//! Both the Manager and the Relay wrap this in their own binary-level error
//! type; `CoreError` only covers failures originating in the Redis/Postgres
//! wrappers so it can be reused unchanged by both.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing or invalid configuration: {0}")]
    Config(String),

    #[error("redis unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("postgres unavailable: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("rejected query: {0}")]
    InvalidQuery(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// True for failures that mean "the upstream dependency is down", as
    /// opposed to a caller error — used by callers that must degrade
    /// gracefully per spec §7's propagation policy instead of failing the
    /// whole request.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, CoreError::Redis(_) | CoreError::Postgres(_))
    }
}
