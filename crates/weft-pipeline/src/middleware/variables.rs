//! Runtime variable resolution (spec §4.2).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// Resolves a set of runtime variables, possibly by calling out (e.g. to a
/// state store or an external service).
#[async_trait]
pub trait VariableProvider: Send + Sync {
    async fn resolve(&self, ctx: &ExecutionContext) -> std::result::Result<HashMap<String, String>, String>;
}

/// Runs each configured [`VariableProvider`] in order, each later provider's
/// keys overwriting earlier ones (and any caller-supplied value already in
/// `ctx.variables`). The first provider failure aborts the turn before
/// `next`.
pub struct VariableProviderMiddleware {
    providers: Vec<Box<dyn VariableProvider>>,
}

impl VariableProviderMiddleware {
    pub fn new(providers: Vec<Box<dyn VariableProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Middleware for VariableProviderMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        for provider in &self.providers {
            match provider.resolve(ctx).await {
                Ok(resolved) => ctx.variables.extend(resolved),
                Err(err) => return Err(PipelineError::Configuration(err)),
            }
        }
        next.run(ctx).await
    }
}
