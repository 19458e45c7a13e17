//! Orchestrator-level error taxonomy, mirrored on
//! `analysis-core::error::AnalysisError`'s shape: one variant per bucket,
//! so callers (an eventual HTTP layer, the scheduler) can branch on kind
//! without downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("risk blocked [{gate}]: {reason}")]
    RiskBlocked { gate: String, reason: String },
    #[error("broker error: {0}")]
    BrokerError(String),
    #[error("upstream data provider error: {0}")]
    UpstreamError(String),
    #[error(transparent)]
    StoreError(#[from] anyhow::Error),
}
