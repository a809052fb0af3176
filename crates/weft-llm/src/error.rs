//! Provider-layer error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors a [`crate::Provider`] implementation can return.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Network and rate-limit errors are transient; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Network(format!("request timed out: {err}"))
        } else if err.is_connect() {
            ProviderError::Network(format!("connection failed: {err}"))
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Serialization(err.to_string())
    }
}
