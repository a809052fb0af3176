//! Token-budget enforcement via truncation (spec §4.2).

use async_trait::async_trait;
use serde_json::Value;

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use weft_types::Message;

/// How to reduce the message list when it exceeds budget. `Relevance` and
/// `Summarize` currently fall through to `Oldest` — the spec's own wording
/// ("currently fall through") pins this down rather than leaving it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStrategy {
    Oldest,
    Relevance,
    Summarize,
    Fail,
}

#[derive(Debug, Clone)]
pub struct ContextBudgetPolicy {
    /// Zero disables enforcement entirely (spec §8 invariant 6: a zero
    /// budget never truncates, regardless of message size) — distinct from
    /// a positive budget too small to fit the system prompt, which fails
    /// the turn.
    pub budget: u64,
    pub reserve_for_output: u64,
    pub strategy: TruncationStrategy,
    pub cache_breakpoints: bool,
}

impl Default for ContextBudgetPolicy {
    fn default() -> Self {
        Self {
            budget: 0,
            reserve_for_output: 0,
            strategy: TruncationStrategy::Oldest,
            cache_breakpoints: false,
        }
    }
}

fn estimate_tokens(text: &str) -> f64 {
    text.split_whitespace().count() as f64 * 1.3
}

fn estimate_message_tokens(msg: &Message) -> f64 {
    let mut total = estimate_tokens(&msg.content);
    for call in &msg.tool_calls {
        total += estimate_tokens(&call.arguments.to_string());
    }
    total
}

pub struct ContextBudgetMiddleware {
    policy: ContextBudgetPolicy,
}

impl ContextBudgetMiddleware {
    pub fn new(policy: ContextBudgetPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for ContextBudgetMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if self.policy.budget > 0 {
            let system_tokens = estimate_tokens(&ctx.prompt);
            let available = self.policy.budget as f64 - self.policy.reserve_for_output as f64 - system_tokens;
            if available <= 0.0 {
                return Err(PipelineError::budget_too_small());
            }

            let message_costs: Vec<f64> = ctx.messages.iter().map(estimate_message_tokens).collect();
            let total: f64 = message_costs.iter().sum();

            if total > available {
                match self.policy.strategy {
                    TruncationStrategy::Fail => return Err(PipelineError::budget_exceeded()),
                    TruncationStrategy::Oldest | TruncationStrategy::Relevance | TruncationStrategy::Summarize => {
                        let original_count = ctx.messages.len();
                        let mut keep_from = ctx.messages.len();
                        let mut running = 0.0;
                        for (index, cost) in message_costs.iter().enumerate().rev() {
                            if running + cost > available {
                                break;
                            }
                            running += cost;
                            keep_from = index;
                        }
                        if keep_from > 0 {
                            ctx.messages.drain(0..keep_from);
                            let dropped = original_count - ctx.messages.len();
                            ctx.set_metadata("context_truncated", Value::Bool(true));
                            ctx.set_metadata("context_original_count", Value::from(original_count as u64));
                            ctx.set_metadata("context_truncated_count", Value::from(dropped as u64));
                            ctx.set_metadata("context_dropped_count", Value::from(dropped as u64));
                        }
                    }
                }
            }

            if self.policy.cache_breakpoints {
                ctx.set_metadata("enable_cache_breakpoints", Value::Bool(true));
            }
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use std::sync::Arc;

    fn message_with_words(n: usize) -> Message {
        Message::user(vec!["word"; n].join(" "))
    }

    #[tokio::test]
    async fn zero_budget_never_truncates() {
        let mut ctx = ExecutionContext::new();
        for _ in 0..20 {
            ctx.messages.push(message_with_words(50));
        }
        let mw = ContextBudgetMiddleware::new(ContextBudgetPolicy::default());
        let chain = Chain::new(vec![Arc::new(mw)]);
        chain.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.messages.len(), 20);
        assert!(ctx.get_metadata("context_truncated").is_none());
    }

    #[tokio::test]
    async fn budget_at_or_above_estimate_is_identity() {
        let mut ctx = ExecutionContext::new();
        ctx.messages.push(message_with_words(5));
        let mw = ContextBudgetMiddleware::new(ContextBudgetPolicy {
            budget: 1000,
            reserve_for_output: 0,
            strategy: TruncationStrategy::Oldest,
            cache_breakpoints: false,
        });
        let chain = Chain::new(vec![Arc::new(mw)]);
        chain.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.messages.len(), 1);
        assert!(ctx.get_metadata("context_truncated").is_none());
    }

    #[tokio::test]
    async fn too_small_for_system_prompt_fails_before_provider() {
        let mut ctx = ExecutionContext::new();
        ctx.prompt = "word ".repeat(100);
        let mw = ContextBudgetMiddleware::new(ContextBudgetPolicy {
            budget: 10,
            reserve_for_output: 5,
            strategy: TruncationStrategy::Oldest,
            cache_breakpoints: false,
        });
        let chain = Chain::new(vec![Arc::new(mw)]);
        let result = chain.process(&mut ctx).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().to_string(), "token budget too small");
    }

    #[tokio::test]
    async fn fail_strategy_errors_on_overflow() {
        let mut ctx = ExecutionContext::new();
        for _ in 0..5 {
            ctx.messages.push(message_with_words(20));
        }
        let mw = ContextBudgetMiddleware::new(ContextBudgetPolicy {
            budget: 20,
            reserve_for_output: 0,
            strategy: TruncationStrategy::Fail,
            cache_breakpoints: false,
        });
        let chain = Chain::new(vec![Arc::new(mw)]);
        let result = chain.process(&mut ctx).await;
        assert_eq!(result.unwrap_err().to_string(), "token budget exceeded");
    }
}
