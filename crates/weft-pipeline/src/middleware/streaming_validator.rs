//! Streaming + whole-response validation (spec §4.6).
//!
//! Validators are looked up by type name rather than cached as live trait
//! objects: the resolved config (type name + params) is what gets cached in
//! `metadata["_validators"]`/`metadata["_validator_params"]`, since the
//! metadata bag only holds `serde_json::Value`. The validator impls
//! themselves are zero-sized and stateless, so rebuilding one from its type
//! name on each chunk costs nothing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::chain::{Middleware, Next};
use crate::context::{ExecutionContext, StreamChunk};
use crate::error::{PipelineError, Result};
use weft_types::{Role, ValidationOutcome};

/// One configured validator, as authored by prompt assembly or a caller
/// (spec §4.2, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub validator_type: String,
    pub enabled: bool,
    #[serde(default)]
    pub params: Value,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            validator_type: String::new(),
            enabled: true,
            params: Value::Null,
        }
    }
}

/// Aggregated validation failure (spec §7, "Validation error").
#[derive(Debug, Error)]
#[error("validation failed: {failures:?}")]
pub struct ValidationError {
    pub kind: String,
    pub details: Value,
    pub failures: Vec<ValidationOutcome>,
}

/// A validator's rule body. `validate_chunk` is only ever invoked when
/// `supports_streaming()` is true; `validate_full` runs over the complete
/// response content, whether or not streaming ran.
pub trait StreamingValidator: Send + Sync {
    fn validator_type(&self) -> &str;
    fn supports_streaming(&self) -> bool;
    fn validate_chunk(&self, accumulated_content: &str, params: &Value) -> std::result::Result<(), String>;
    fn validate_full(&self, content: &str, params: &Value) -> std::result::Result<(), String>;
}

/// Case-insensitive substring match against `params.words` (an array of
/// strings).
pub struct BannedWordsValidator;

impl BannedWordsValidator {
    fn check(&self, content: &str, params: &Value) -> std::result::Result<(), String> {
        let words = params.get("words").and_then(Value::as_array).cloned().unwrap_or_default();
        let lower = content.to_lowercase();
        for word in words {
            if let Some(word) = word.as_str() {
                if lower.contains(&word.to_lowercase()) {
                    return Err(format!("banned word detected: {word}"));
                }
            }
        }
        Ok(())
    }
}

impl StreamingValidator for BannedWordsValidator {
    fn validator_type(&self) -> &str {
        "banned_words"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn validate_chunk(&self, accumulated_content: &str, params: &Value) -> std::result::Result<(), String> {
        self.check(accumulated_content, params)
    }

    fn validate_full(&self, content: &str, params: &Value) -> std::result::Result<(), String> {
        self.check(content, params)
    }
}

/// Character-count ceiling from `params.max_length`.
pub struct MaxLengthValidator;

impl MaxLengthValidator {
    fn check(&self, content: &str, params: &Value) -> std::result::Result<(), String> {
        let max = params.get("max_length").and_then(Value::as_u64).unwrap_or(u64::MAX);
        let len = content.chars().count() as u64;
        if len > max {
            Err(format!("content length {len} exceeds max_length {max}"))
        } else {
            Ok(())
        }
    }
}

impl StreamingValidator for MaxLengthValidator {
    fn validator_type(&self) -> &str {
        "max_length"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn validate_chunk(&self, accumulated_content: &str, params: &Value) -> std::result::Result<(), String> {
        self.check(accumulated_content, params)
    }

    fn validate_full(&self, content: &str, params: &Value) -> std::result::Result<(), String> {
        self.check(content, params)
    }
}

/// Whole-response-only probe, used by tests to exercise the
/// `supports_streaming()` split — never exercised in production config.
pub struct ProbeValidator;

impl StreamingValidator for ProbeValidator {
    fn validator_type(&self) -> &str {
        "probe"
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn validate_chunk(&self, _accumulated_content: &str, _params: &Value) -> std::result::Result<(), String> {
        unreachable!("probe validator does not support streaming")
    }

    fn validate_full(&self, content: &str, _params: &Value) -> std::result::Result<(), String> {
        if content.is_empty() {
            Err("probe: empty content".to_string())
        } else {
            Ok(())
        }
    }
}

fn build_validator(validator_type: &str) -> Option<Arc<dyn StreamingValidator>> {
    match validator_type {
        "banned_words" => Some(Arc::new(BannedWordsValidator)),
        "max_length" => Some(Arc::new(MaxLengthValidator)),
        "probe" => Some(Arc::new(ProbeValidator)),
        other => {
            tracing::warn!(validator_type = other, "unknown validator type, skipping");
            None
        }
    }
}

/// Build (or fetch the cached) resolved `(type, params)` list from
/// `metadata["validator_configs"]`.
fn resolved_validators(ctx: &ExecutionContext) -> Vec<(String, Value)> {
    if let (Some(types), Some(params)) = (ctx.get_metadata("_validators"), ctx.get_metadata("_validator_params")) {
        let types: Vec<String> = serde_json::from_value(types).unwrap_or_default();
        let params: Vec<Value> = serde_json::from_value(params).unwrap_or_default();
        return types.into_iter().zip(params).collect();
    }

    let configs: Vec<ValidatorConfig> = ctx
        .get_metadata("validator_configs")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let types: Vec<String> = configs.iter().map(|c| c.validator_type.clone()).collect();
    let params: Vec<Value> = configs.iter().map(|c| c.params.clone()).collect();
    ctx.set_metadata("_validators", serde_json::to_value(&types).unwrap_or(Value::Null));
    ctx.set_metadata("_validator_params", serde_json::to_value(&params).unwrap_or(Value::Null));
    types.into_iter().zip(params).collect()
}

fn push_streaming_result(ctx: &ExecutionContext, outcome: ValidationOutcome) {
    let mut results: Vec<ValidationOutcome> = ctx
        .get_metadata("_streaming_validation_results")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    results.push(outcome);
    ctx.set_metadata(
        "_streaming_validation_results",
        serde_json::to_value(&results).unwrap_or(Value::Null),
    );
}

fn streaming_results(ctx: &ExecutionContext) -> Vec<ValidationOutcome> {
    ctx.get_metadata("_streaming_validation_results")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Drives per-chunk and whole-response validation and stream interruption.
pub struct StreamingValidatorMiddleware {
    /// When true, failed validation is recorded but does not surface as a
    /// hard turn error (the stream may still be interrupted).
    suppress: bool,
}

impl StreamingValidatorMiddleware {
    pub fn new(suppress: bool) -> Self {
        Self { suppress }
    }
}

#[async_trait]
impl Middleware for StreamingValidatorMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let next_result = next.run(ctx).await;

        let last_assistant = ctx.messages.iter().rposition(|m| m.role == Role::Assistant);
        let mut validation_err = None;

        if let Some(idx) = last_assistant {
            let content = ctx.messages[idx].content.clone();
            if !content.is_empty() {
                let validators = resolved_validators(ctx);
                let mut results = streaming_results(ctx);
                let already_ran: HashSet<String> = results.iter().map(|r| r.validator_type.clone()).collect();

                for (vtype, params) in &validators {
                    let Some(validator) = build_validator(vtype) else {
                        continue;
                    };
                    if ctx.stream_mode && validator.supports_streaming() && already_ran.contains(vtype) {
                        continue;
                    }
                    match validator.validate_full(&content, params) {
                        Ok(()) => results.push(ValidationOutcome::pass(vtype.clone())),
                        Err(reason) => results.push(ValidationOutcome::fail(
                            vtype.clone(),
                            json!({"error": reason}),
                        )),
                    }
                }

                let failures: Vec<ValidationOutcome> = results.iter().filter(|r| !r.passed).cloned().collect();
                ctx.messages[idx].validations = results;

                if !failures.is_empty() && !self.suppress {
                    let failure_count = failures.len();
                    validation_err = Some(PipelineError::Validation(ValidationError {
                        kind: "validation_failed".to_string(),
                        details: json!({"failure_count": failure_count}),
                        failures,
                    }));
                }
            }
        }

        match (validation_err, next_result) {
            (Some(err), _) => Err(err),
            (None, Err(err)) => Err(err),
            (None, Ok(())) => Ok(()),
        }
    }

    async fn stream_chunk(&self, ctx: &ExecutionContext, chunk: StreamChunk) -> Result<StreamChunk> {
        let validators = resolved_validators(ctx);
        let content = chunk.content.clone().unwrap_or_default();
        ctx.set_metadata("_streaming_content_buffer", Value::String(content.clone()));

        let mut hard_error = None;
        for (vtype, params) in &validators {
            let Some(validator) = build_validator(vtype) else {
                continue;
            };
            if !validator.supports_streaming() {
                continue;
            }
            if let Err(reason) = validator.validate_chunk(&content, params) {
                ctx.interrupt_stream(reason.clone());
                push_streaming_result(
                    ctx,
                    ValidationOutcome::fail(
                        vtype.clone(),
                        json!({"error": reason, "content_length": content.len()}),
                    ),
                );
                ctx.set_metadata("_streaming_validation_failed", Value::Bool(true));
                if !self.suppress && hard_error.is_none() {
                    hard_error = Some(PipelineError::Validation(ValidationError {
                        kind: "validation_failed".to_string(),
                        details: json!({"error": reason}),
                        failures: vec![ValidationOutcome::fail(vtype.clone(), json!({"error": reason}))],
                    }));
                }
            }
        }

        if chunk.is_terminal() {
            for (vtype, _) in &validators {
                if let Some(validator) = build_validator(vtype) {
                    if validator.supports_streaming() {
                        push_streaming_result(ctx, ValidationOutcome::pass(vtype.clone()));
                    }
                }
            }
        }

        match hard_error {
            Some(err) => Err(err),
            None => Ok(chunk),
        }
    }
}
