//! Prompt assembly middleware (spec §4.2, brief).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::streaming_validator::ValidatorConfig;
use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// One entry in the [`PromptRegistry`], keyed by task type.
#[derive(Debug, Clone, Default)]
pub struct PromptConfig {
    pub system_template: String,
    pub allowed_tools: Vec<String>,
    pub validators: Vec<ValidatorConfig>,
    pub default_variables: HashMap<String, String>,
}

/// Looks up a [`PromptConfig`] by task type.
#[derive(Debug, Default)]
pub struct PromptRegistry {
    configs: HashMap<String, PromptConfig>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, config: PromptConfig) {
        self.configs.insert(task_type.into(), config);
    }

    pub fn get(&self, task_type: &str) -> Option<&PromptConfig> {
        self.configs.get(task_type)
    }
}

/// Loads the system template, tool allowlist, and validator configs for a
/// fixed task type, and merges the config's default variables into
/// `ctx.variables` without overwriting whatever the caller already set.
pub struct PromptAssemblyMiddleware {
    registry: Option<Arc<PromptRegistry>>,
    task_type: String,
}

impl PromptAssemblyMiddleware {
    pub fn new(registry: Option<Arc<PromptRegistry>>, task_type: impl Into<String>) -> Self {
        Self {
            registry,
            task_type: task_type.into(),
        }
    }
}

#[async_trait]
impl Middleware for PromptAssemblyMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        match self.registry.as_ref().and_then(|r| r.get(&self.task_type)) {
            Some(config) => {
                ctx.system_prompt = config.system_template.clone();
                ctx.allowed_tools = config.allowed_tools.clone();

                let enabled: Vec<&ValidatorConfig> =
                    config.validators.iter().filter(|v| v.enabled).collect();
                ctx.set_metadata(
                    "validator_configs",
                    serde_json::to_value(&enabled).unwrap_or(serde_json::Value::Null),
                );

                for (key, value) in &config.default_variables {
                    ctx.variables.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            None => {
                ctx.system_prompt = DEFAULT_SYSTEM_PROMPT.to_string();
                ctx.allowed_tools.clear();
            }
        }

        next.run(ctx).await
    }
}
