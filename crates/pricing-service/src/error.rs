use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("upstream timeout")]
    Timeout,
    #[error("upstream connection failed: {0}")]
    Connection(String),
    #[error("symbol not found: {0}")]
    NotFound(String),
}
