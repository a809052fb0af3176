//! Validation result records attached to assistant messages (spec §4.6).

use serde::{Deserialize, Serialize};

/// One validator's verdict, either per-chunk or whole-response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub validator_type: String,
    pub passed: bool,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ValidationOutcome {
    pub fn pass(validator_type: impl Into<String>) -> Self {
        Self {
            validator_type: validator_type.into(),
            passed: true,
            details: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn fail(validator_type: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            validator_type: validator_type.into(),
            passed: false,
            details,
            timestamp: chrono::Utc::now(),
        }
    }
}
