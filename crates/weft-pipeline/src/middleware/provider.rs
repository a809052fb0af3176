//! LLM invocation, the multi-round tool-calling loop, and its streaming
//! variant (spec §4.4) — the hardest single middleware in the chain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;

use crate::chain::{Middleware, Next};
use crate::context::{ExecutionContext, LlmCallRecord, PipelineResponse, StreamChunk, ToolExecutionResult};
use crate::error::{PipelineError, Result};
use crate::tool::{ToolContext, ToolRegistry};
use weft_llm::{
    ContentDelta, Provider, ProviderMessage, ProviderRequest, ProviderResponse, ProviderRole,
    ProviderToolCall, ProviderToolResult, SharedProvider, StreamEvent, ToolChoice, Usage,
};
use weft_types::{ContentPart, CostInfo, Message, Role, Source, ToolCallRecord, ToolResultPayload};

/// Turn-level knobs for the provider middleware's round loop.
#[derive(Debug, Clone)]
pub struct RoundPolicy {
    pub max_rounds: u32,
    pub max_tool_calls_per_turn: Option<u32>,
    pub tool_choice: ToolChoice,
    pub blocked_tools: Vec<String>,
    /// Skip writing `ExecutionTrace` records for this turn.
    pub disable_trace: bool,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            max_tool_calls_per_turn: None,
            tool_choice: ToolChoice::Auto,
            blocked_tools: Vec::new(),
            disable_trace: false,
        }
    }
}

enum ToolRoundOutcome {
    Done,
    MoreRounds,
}

pub(crate) fn to_provider_message(msg: &Message) -> Option<ProviderMessage> {
    let role = match msg.role {
        Role::User => ProviderRole::User,
        Role::Assistant => ProviderRole::Assistant,
        Role::Tool => ProviderRole::Tool,
        Role::System => return None,
    };
    Some(ProviderMessage {
        role,
        content: msg.content.clone(),
        parts: msg.parts.clone(),
        tool_calls: msg
            .tool_calls
            .iter()
            .map(|c| ProviderToolCall {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect(),
        tool_result: msg.tool_result.as_ref().map(|r| ProviderToolResult {
            tool_call_id: r.tool_call_id.clone(),
            content: r.content.clone(),
            is_error: r.is_error(),
        }),
    })
}

/// `complete` -> canonical string, `failed` -> error-prefixed text, else the
/// message left untouched by `registry.execute_async`'s failure path (spec
/// §4.4 tool round, step 3).
pub(crate) fn format_tool_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Translates the accumulated context into a provider request: filters
/// `Role::System` messages (system content travels via `request.system`
/// instead), preserves multimodal parts and tool-calls, and copies metadata
/// by value. Shared with the duplex coordinator, which builds its initial
/// request the same way.
pub(crate) fn build_request_for(model: &str, ctx: &ExecutionContext) -> ProviderRequest {
    let messages: Vec<ProviderMessage> = ctx.messages.iter().filter_map(to_provider_message).collect();
    let mut request = ProviderRequest::new(model, messages);
    if !ctx.prompt.is_empty() {
        request = request.with_system(ctx.prompt.clone());
    }
    request.metadata = ctx.metadata_snapshot();
    request
}

/// Converts the accumulated context into a provider request, invokes the
/// provider, drives the multi-round tool loop, and appends assistant/tool
/// messages with telemetry.
pub struct ProviderMiddleware {
    provider: SharedProvider,
    model: String,
    tool_registry: Option<Arc<ToolRegistry>>,
    policy: RoundPolicy,
}

impl ProviderMiddleware {
    pub fn new(provider: SharedProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            tool_registry: None,
            policy: RoundPolicy::default(),
        }
    }

    pub fn with_tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tool_registry = Some(registry);
        self
    }

    pub fn with_policy(mut self, policy: RoundPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn build_request(&self, ctx: &ExecutionContext) -> ProviderRequest {
        build_request_for(&self.model, ctx)
    }

    fn round_tool_choice(&self, round: u32) -> ToolChoice {
        if round == 1 {
            self.policy.tool_choice.clone()
        } else {
            ToolChoice::Auto
        }
    }

    fn is_multimodal(ctx: &ExecutionContext) -> bool {
        ctx.messages
            .iter()
            .any(|m| m.parts.iter().any(|p| !matches!(p, ContentPart::Text { .. })))
    }

    /// If a tool registry and allowed tools are configured and the provider
    /// implements the tool-support capability, build the provider-side
    /// tooling handle. Any unmet precondition or build failure degrades to
    /// "proceed without tools" rather than a hard error (spec §4.4, "Tool
    /// preparation").
    fn prepare_tooling(&self, ctx: &ExecutionContext) -> Option<weft_llm::ToolingHandle> {
        let registry = self.tool_registry.as_ref()?;
        if ctx.allowed_tools.is_empty() {
            return None;
        }
        let tool_capable = self.provider.tool_capable()?;
        let descriptors = registry.get_tools_by_names(&ctx.allowed_tools);
        match tool_capable.build_tooling(&descriptors) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "failed to build tool handle, proceeding without tools");
                None
            }
        }
    }

    async fn invoke(&self, ctx: &ExecutionContext, round: u32) -> Result<(ProviderResponse, Vec<ToolCallRecord>)> {
        let request = self.build_request(ctx);
        let tool_choice = self.round_tool_choice(round);
        let tooling = self.prepare_tooling(ctx);

        let (response, provider_tool_calls): (ProviderResponse, Vec<ProviderToolCall>) =
            if let Some(handle) = &tooling {
                let tool_capable = self
                    .provider
                    .tool_capable()
                    .expect("tooling built implies the capability is present");
                tool_capable.predict_with_tools(request, handle, tool_choice).await?
            } else if Self::is_multimodal(ctx) {
                if let Some(multimodal) = self.provider.multimodal_capable() {
                    let r = multimodal.predict_multimodal(request).await?;
                    let tc = r.tool_calls.clone();
                    (r, tc)
                } else {
                    let r = self.provider.predict(request).await?;
                    let tc = r.tool_calls.clone();
                    (r, tc)
                }
            } else {
                let r = self.provider.predict(request).await?;
                let tc = r.tool_calls.clone();
                (r, tc)
            };

        let records = provider_tool_calls
            .into_iter()
            .map(|c| ToolCallRecord {
                id: c.id,
                name: c.name,
                arguments: c.arguments,
            })
            .collect();
        Ok((response, records))
    }

    async fn run_rounds(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let mut round: u32 = 0;
        loop {
            round += 1;
            if round > self.policy.max_rounds {
                return Err(PipelineError::max_rounds_exceeded(self.policy.max_rounds));
            }

            let started_at = Utc::now();
            let start = Instant::now();
            let (response, tool_calls) = self.invoke(ctx, round).await?;
            let duration = start.elapsed();

            let cost = CostInfo::new(
                response.usage.input_tokens,
                response.usage.output_tokens,
                self.provider.calculate_cost(
                    response.usage.input_tokens,
                    response.usage.output_tokens,
                    response.usage.cached_tokens,
                ),
            );
            ctx.cost_info.accumulate(&cost);
            ctx.set_metadata("cost_estimate_type", Value::String("exact".to_string()));

            let final_text = if tool_calls.is_empty() { response.text.clone() } else { String::new() };
            ctx.response = Some(PipelineResponse {
                content: final_text,
                tool_calls: tool_calls.clone(),
            });
            ctx.raw_response = Some(response.clone());

            let message_index = ctx.messages.len();
            if !self.policy.disable_trace {
                ctx.trace.push(LlmCallRecord {
                    sequence: ctx.trace.llm_calls.len() + 1,
                    message_index,
                    response: Some(response.clone()),
                    started_at,
                    duration,
                    cost: Some(cost),
                    error: None,
                });
            }

            let mut assistant_msg = Message::assistant(response.text.clone());
            assistant_msg.tool_calls = tool_calls.clone();
            assistant_msg.source = Source::Pipeline;
            assistant_msg.latency_ms = duration.as_millis() as u64;
            assistant_msg.cost = cost;
            ctx.messages.push(assistant_msg);

            match self.run_tool_round(ctx, &tool_calls).await? {
                ToolRoundOutcome::Done => return Ok(()),
                ToolRoundOutcome::MoreRounds => continue,
            }
        }
    }

    async fn run_streaming(&self, ctx: &mut ExecutionContext, next: &Next<'_>) -> Result<()> {
        let mut round: u32 = 0;
        loop {
            round += 1;
            if round > self.policy.max_rounds {
                return Err(PipelineError::max_rounds_exceeded(self.policy.max_rounds));
            }

            let request = self.build_request(ctx);
            let mut stream = self.provider.predict_stream(request).await?;

            let started_at = Utc::now();
            let start = Instant::now();
            let mut content = String::new();
            let mut tool_buffers: HashMap<usize, (Option<String>, Option<String>, String)> = HashMap::new();
            let mut final_usage: Option<Usage> = None;
            let mut interrupted = false;

            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        let chunk = StreamChunk {
                            error: Some(err.to_string()),
                            ..Default::default()
                        };
                        next.emit(ctx, chunk).await;
                        return Err(PipelineError::Provider(err));
                    }
                };

                match &event {
                    StreamEvent::ContentDelta { delta: ContentDelta::Text(text) } => {
                        content.push_str(text);
                        let chunk = StreamChunk {
                            delta_text: Some(text.clone()),
                            content: Some(content.clone()),
                            ..Default::default()
                        };
                        if !next.emit(ctx, chunk).await {
                            interrupted = true;
                        }
                    }
                    StreamEvent::ToolCallDelta { index, id, name, arguments_fragment } => {
                        let entry = tool_buffers.entry(*index).or_insert((None, None, String::new()));
                        if let Some(id) = id {
                            entry.0 = Some(id.clone());
                        }
                        if let Some(name) = name {
                            entry.1 = Some(name.clone());
                        }
                        entry.2.push_str(arguments_fragment);
                    }
                    StreamEvent::MessageDelta { stop_reason, usage } => {
                        final_usage = Some(*usage);
                        let chunk = StreamChunk {
                            content: Some(content.clone()),
                            finish_reason: Some(format!("{stop_reason:?}")),
                            ..Default::default()
                        };
                        if !next.emit(ctx, chunk).await {
                            interrupted = true;
                        }
                    }
                    StreamEvent::MessageStart { .. } | StreamEvent::MessageStop => {}
                    StreamEvent::Error { message } => {
                        let chunk = StreamChunk {
                            error: Some(message.clone()),
                            ..Default::default()
                        };
                        next.emit(ctx, chunk).await;
                        return Err(PipelineError::Stream(message.clone()));
                    }
                }

                if interrupted || ctx.is_stream_interrupted() {
                    interrupted = true;
                    break;
                }
            }

            let duration = start.elapsed();

            if interrupted || ctx.is_stream_interrupted() {
                let system_len = ctx.prompt.len();
                let messages_len: usize = ctx.messages.iter().map(|m| m.content.len()).sum();
                let approx_input = (system_len + messages_len) / 4 + 4 * ctx.messages.len();
                let approx_output = std::cmp::max(1, content.len() / 4);
                let approx_cost =
                    self.provider.calculate_cost(approx_input as u64, approx_output as u64, 0);
                let cost = CostInfo::new(approx_input as u64, approx_output as u64, approx_cost);
                ctx.cost_info.accumulate(&cost);
                ctx.set_metadata("cost_estimate_type", Value::String("approximate".to_string()));

                if !self.policy.disable_trace {
                    ctx.trace.push(LlmCallRecord {
                        sequence: ctx.trace.llm_calls.len() + 1,
                        message_index: ctx.messages.len(),
                        response: None,
                        started_at,
                        duration,
                        cost: None,
                        error: None,
                    });
                }

                let mut assistant_msg = Message::assistant(content.clone());
                assistant_msg.source = Source::Pipeline;
                assistant_msg.latency_ms = duration.as_millis() as u64;
                assistant_msg.cost = cost;
                ctx.messages.push(assistant_msg);
                ctx.response = Some(PipelineResponse {
                    content,
                    tool_calls: Vec::new(),
                });
                return Ok(());
            }

            let usage = final_usage.unwrap_or_default();
            let cost = CostInfo::new(
                usage.input_tokens,
                usage.output_tokens,
                self.provider
                    .calculate_cost(usage.input_tokens, usage.output_tokens, usage.cached_tokens),
            );
            ctx.cost_info.accumulate(&cost);
            ctx.set_metadata("cost_estimate_type", Value::String("exact".to_string()));

            let tool_calls: Vec<ToolCallRecord> = tool_buffers
                .into_iter()
                .map(|(_, (id, name, args))| ToolCallRecord {
                    id: id.unwrap_or_default(),
                    name: name.unwrap_or_default(),
                    arguments: serde_json::from_str(&args).unwrap_or(Value::Null),
                })
                .collect();

            let message_index = ctx.messages.len();
            if !self.policy.disable_trace {
                ctx.trace.push(LlmCallRecord {
                    sequence: ctx.trace.llm_calls.len() + 1,
                    message_index,
                    response: None,
                    started_at,
                    duration,
                    cost: Some(cost),
                    error: None,
                });
            }

            let final_text = if tool_calls.is_empty() { content.clone() } else { String::new() };
            ctx.response = Some(PipelineResponse {
                content: final_text,
                tool_calls: tool_calls.clone(),
            });

            let mut assistant_msg = Message::assistant(content.clone());
            assistant_msg.tool_calls = tool_calls.clone();
            assistant_msg.source = Source::Pipeline;
            assistant_msg.latency_ms = duration.as_millis() as u64;
            assistant_msg.cost = cost;
            ctx.messages.push(assistant_msg);

            match self.run_tool_round(ctx, &tool_calls).await? {
                ToolRoundOutcome::Done => return Ok(()),
                ToolRoundOutcome::MoreRounds => continue,
            }
        }
    }

    async fn run_tool_round(&self, ctx: &mut ExecutionContext, tool_calls: &[ToolCallRecord]) -> Result<ToolRoundOutcome> {
        if tool_calls.is_empty() {
            return Ok(ToolRoundOutcome::Done);
        }
        let Some(registry) = self.tool_registry.clone() else {
            return Err(PipelineError::Configuration("tool registry not configured".to_string()));
        };
        if let Some(max) = self.policy.max_tool_calls_per_turn {
            if tool_calls.len() as u32 > max {
                return Err(PipelineError::max_tool_calls_exceeded(max));
            }
        }

        let tool_ctx = ToolContext::new(ctx.cancellation.clone());

        for call in tool_calls {
            if let Some(emitter) = &ctx.event_emitter {
                emitter.tool_call_started(&call.name);
            }

            if self.policy.blocked_tools.iter().any(|b| b == &call.name) {
                let payload = ToolResultPayload {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: format!("Tool '{}' is blocked by policy", call.name),
                    error: Some("blocked".to_string()),
                    latency_ms: 0,
                };
                if let Some(emitter) = &ctx.event_emitter {
                    emitter.tool_call_failed(&call.name, "blocked");
                }
                ctx.tool_results.push(payload.clone());
                ctx.messages.push(Message::tool_result(payload));
                continue;
            }

            let start = Instant::now();
            let outcome = registry.execute_async(&call.name, call.arguments.clone(), &tool_ctx).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            let payload = match outcome {
                ToolExecutionResult::Complete { content } => {
                    if let Some(emitter) = &ctx.event_emitter {
                        emitter.tool_call_completed(&call.name);
                    }
                    ToolResultPayload {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: format_tool_content(&content),
                        error: None,
                        latency_ms,
                    }
                }
                ToolExecutionResult::Failed { error } => {
                    if let Some(emitter) = &ctx.event_emitter {
                        emitter.tool_call_failed(&call.name, &error);
                    }
                    ToolResultPayload {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: format!("Tool execution failed: {error}"),
                        error: Some(error),
                        latency_ms,
                    }
                }
                ToolExecutionResult::Pending { info } => {
                    let mut info = info;
                    info.tool_call_id = call.id.clone();
                    let message = info.message.clone();
                    ctx.add_pending_tool_call(call.clone());
                    ctx.push_pending_tool(info);
                    ToolResultPayload {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        content: message,
                        error: None,
                        latency_ms,
                    }
                }
            };

            ctx.tool_results.push(payload.clone());
            ctx.messages.push(Message::tool_result(payload));
        }

        if ctx.has_pending_tool_calls() {
            return Err(PipelineError::pending_tool_calls());
        }

        Ok(ToolRoundOutcome::MoreRounds)
    }
}

#[async_trait]
impl Middleware for ProviderMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let result = if ctx.stream_mode {
            self.run_streaming(ctx, &next).await
        } else {
            self.run_rounds(ctx).await
        };

        let next_result = next.run(ctx).await;

        match (result, next_result) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
