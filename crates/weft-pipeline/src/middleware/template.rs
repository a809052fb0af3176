//! `{{name}}` substitution into the assembled prompt (spec §4.2).

use async_trait::async_trait;

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;

/// Replaces every `{{name}}` in `ctx.system_prompt` with `ctx.variables[name]`
/// and writes the result to `ctx.prompt`. Literal substitution: no escaping,
/// and a missing key leaves the placeholder untouched.
pub struct TemplateMiddleware;

impl TemplateMiddleware {
    fn render(template: &str, variables: &std::collections::HashMap<String, String>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match variables.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("{{");
                            out.push_str(&after[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl Middleware for TemplateMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        ctx.prompt = Self::render(&ctx.system_prompt, &ctx.variables);
        next.run(ctx).await
    }
}
