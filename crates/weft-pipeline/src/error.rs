//! Pipeline-level error type (spec §7).

use thiserror::Error;
use weft_llm::ProviderError;

use crate::middleware::streaming_validator::ValidationError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors a middleware's `process` can return.
///
/// One variant per error-taxonomy bullet in spec §7; `Display` text matches
/// the exact strings the scenarios in spec §8 assert against.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Budget(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool execution error: {0}")]
    ToolExecution(String),

    #[error("{0}")]
    Policy(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn budget_too_small() -> Self {
        Self::Budget("token budget too small".to_string())
    }

    pub fn budget_exceeded() -> Self {
        Self::Budget("token budget exceeded".to_string())
    }

    pub fn max_rounds_exceeded(max: u32) -> Self {
        Self::Policy(format!("exceeded max rounds ({max})"))
    }

    pub fn max_tool_calls_exceeded(max: u32) -> Self {
        Self::Policy(format!("exceeded max tool calls per turn ({max})"))
    }

    pub fn pending_tool_calls() -> Self {
        Self::Policy("execution paused: pending tool calls require approval".to_string())
    }
}
