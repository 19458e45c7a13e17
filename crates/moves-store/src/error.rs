use thiserror::Error;

/// Error taxonomy shared across engine crates (spec section 7), not tied to
/// any one crate's internal representation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("risk blocked ({gate}): {reason}")]
    RiskBlocked { gate: String, reason: String },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("upstream error: {0}")]
    Upstream(String),
}
