//! Bidirectional (WebSocket-like) streaming coordinator (spec §4.5).
//!
//! Built on the same `tokio::spawn` + `tokio::sync::mpsc` +
//! `tokio_util::sync::CancellationToken` concurrency idiom used for the
//! single-direction streaming path in [`crate::middleware::provider`],
//! extended to two cooperating tasks since input and output now flow
//! independently.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::chain::{Middleware, Next};
use crate::context::{ExecutionContext, PipelineResponse, StreamChunk, ToolExecutionResult};
use crate::error::{PipelineError, Result};
use crate::middleware::provider::{build_request_for, format_tool_content};
use crate::tool::{ToolContext, ToolRegistry};
use weft_llm::{DuplexElement, DuplexMediaChunk, DuplexProvider, SharedProvider, StreamInputSession};
use weft_types::{Message, Source, ToolCallRecord, ToolResultPayload};

/// Classification of one [`DuplexElement`] per the response state machine
/// (spec §4.5).
enum Action {
    Continue,
    Complete,
    ToolCalls,
    Error(String),
}

fn classify(element: &DuplexElement) -> Action {
    if let Some(err) = &element.error {
        return Action::Error(err.clone());
    }
    let interrupted = element
        .metadata
        .get("interrupted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let interrupted_turn_complete = element
        .metadata
        .get("interrupted_turn_complete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if interrupted || interrupted_turn_complete {
        return Action::Continue;
    }
    if element.end_of_stream {
        let has_content = element.content.as_deref().map(|c| !c.is_empty()).unwrap_or(false);
        let has_tool_calls = !element.tool_calls.is_empty();
        return if has_content {
            Action::Complete
        } else if has_tool_calls {
            Action::ToolCalls
        } else {
            Action::Error("empty response, likely interrupted".to_string())
        };
    }
    Action::Continue
}

/// Empties any buffered elements left on a session's response channel so a
/// stale partial response from a prior turn cannot race the next turn's
/// real reply. Not called automatically by [`DuplexMiddleware`] (which opens
/// a fresh session per turn) — for callers that keep a session alive across
/// turns, call this between them.
pub async fn drain_stale_responses(session: &dyn StreamInputSession) {
    loop {
        match tokio::time::timeout(Duration::from_millis(10), session.recv_response()).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
}

/// Coordinates a bidirectional provider session: forwards caller input to
/// the session on one task, collects the session's responses on another,
/// and reconciles both into `ctx.messages` / `ctx.response`.
pub struct DuplexMiddleware {
    provider: SharedProvider,
    model: String,
    tool_registry: Option<Arc<ToolRegistry>>,
}

impl DuplexMiddleware {
    pub fn new(provider: SharedProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            tool_registry: None,
        }
    }

    pub fn with_tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.tool_registry = Some(registry);
        self
    }

    async fn run_tools(
        &self,
        ctx: &ExecutionContext,
        tool_calls: &[ToolCallRecord],
        session: &Arc<dyn StreamInputSession>,
    ) -> Result<Vec<Message>> {
        let Some(registry) = self.tool_registry.as_ref() else {
            return Err(PipelineError::Configuration("tool registry not configured".to_string()));
        };
        let tool_ctx = ToolContext::new(ctx.cancellation.clone());
        let mut messages = Vec::with_capacity(tool_calls.len());

        for call in tool_calls {
            if let Some(emitter) = &ctx.event_emitter {
                emitter.tool_call_started(&call.name);
            }
            let outcome = registry.execute_async(&call.name, call.arguments.clone(), &tool_ctx).await;
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
                        latency_ms: 0,
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
                        latency_ms: 0,
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
                        latency_ms: 0,
                    }
                }
            };

            // Both a provider-facing echo (so the live session can react)
            // and a `role="tool"` message for state capture (spec §4.5).
            let _ = session
                .send_text(serde_json::to_string(&payload).unwrap_or_default())
                .await;
            messages.push(Message::tool_result(payload));
        }

        Ok(messages)
    }
}

#[async_trait]
impl Middleware for DuplexMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if !ctx.stream_mode || ctx.stream_input.is_none() || ctx.stream_output.is_none() {
            return Err(PipelineError::Configuration(
                "duplex middleware requires stream_mode with stream_input and stream_output configured".to_string(),
            ));
        }
        let Some(duplex_capable) = self.provider.duplex_capable() else {
            return Err(PipelineError::Configuration(
                "provider does not support duplex sessions".to_string(),
            ));
        };

        let request = build_request_for(&self.model, ctx);
        let session: Arc<dyn StreamInputSession> = Arc::from(duplex_capable.open_duplex_session(request).await?);

        let mut stream_input = ctx.stream_input.take().expect("checked above");
        let cancellation = ctx.cancellation.clone();
        let forwarder_session = session.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let next_chunk = tokio::select! {
                    chunk = stream_input.recv() => chunk,
                    _ = cancellation.cancelled() => None,
                };
                let Some(chunk) = next_chunk else { break };

                if let Some(media) = &chunk.media_delta {
                    let data = match &media.data {
                        Some(encoded) => BASE64.decode(encoded).unwrap_or_else(|_| encoded.clone().into_bytes()),
                        None => Vec::new(),
                    };
                    let media_chunk = DuplexMediaChunk {
                        mime: media.mime.clone(),
                        data,
                        sequence: chunk.token_count.unwrap_or(0),
                        timestamp: SystemTime::now(),
                        is_last: chunk.finish_reason.is_some(),
                    };
                    if let Err(err) = forwarder_session.send_chunk(media_chunk).await {
                        tracing::warn!(error = %err, "duplex input forwarder: send_chunk failed");
                    }
                } else if let Some(text) = &chunk.delta_text {
                    if let Err(err) = forwarder_session.send_text(text.clone()).await {
                        tracing::warn!(error = %err, "duplex input forwarder: send_text failed");
                    }
                }
            }
        });

        let mut accumulated = String::new();
        let mut max_tokens: u64 = 0;
        let mut final_error: Option<String> = None;

        loop {
            if ctx.is_cancelled() {
                break;
            }
            let Some(element) = session.recv_response().await else {
                break;
            };

            if let Some(text) = &element.content {
                accumulated.push_str(text);
            }
            if let Some(tokens) = element.metadata.get("total_tokens").and_then(Value::as_u64) {
                max_tokens = max_tokens.max(tokens);
            }

            let action = classify(&element);

            if let Some(output) = &ctx.stream_output {
                let chunk = StreamChunk {
                    content: if accumulated.is_empty() { None } else { Some(accumulated.clone()) },
                    tool_calls: element
                        .tool_calls
                        .iter()
                        .map(|c| ToolCallRecord {
                            id: c.id.clone(),
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        })
                        .collect(),
                    metadata: element.metadata.clone(),
                    end_of_stream: element.end_of_stream,
                    error: element.error.clone(),
                    finish_reason: matches!(action, Action::Complete).then(|| "end_turn".to_string()),
                    ..Default::default()
                };
                let _ = output.send(chunk).await;
            }

            match action {
                Action::Error(reason) => {
                    final_error = Some(reason);
                    break;
                }
                Action::Continue => continue,
                Action::Complete => break,
                Action::ToolCalls => {
                    let tool_calls: Vec<ToolCallRecord> = element
                        .tool_calls
                        .iter()
                        .map(|c| ToolCallRecord {
                            id: c.id.clone(),
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        })
                        .collect();
                    match self.run_tools(ctx, &tool_calls, &session).await {
                        Ok(messages) => ctx.messages.extend(messages),
                        Err(err) => {
                            final_error = Some(err.to_string());
                            break;
                        }
                    }
                    continue;
                }
            }
        }

        match tokio::time::timeout(Duration::from_secs(1), forwarder).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                tracing::warn!(error = %join_err, "duplex input forwarder task panicked");
                if final_error.is_none() {
                    final_error = Some(format!("input forwarder failed: {join_err}"));
                }
            }
            Err(_) => {
                tracing::warn!("duplex input forwarder did not complete within 1s");
            }
        }

        if final_error.is_none() && !accumulated.is_empty() {
            let mut msg = Message::assistant(accumulated.clone());
            msg.source = Source::Pipeline;
            ctx.messages.push(msg);
            ctx.response = Some(PipelineResponse {
                content: accumulated,
                tool_calls: Vec::new(),
            });
        }
        if max_tokens > 0 {
            ctx.set_metadata("duplex_total_tokens", Value::from(max_tokens));
        }

        let next_result = next.run(ctx).await;

        match (final_error, next_result) {
            (Some(err), _) => Err(PipelineError::Stream(err)),
            (None, Err(err)) => Err(err),
            (None, Ok(())) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::tool::MockOutcome;
    use std::collections::HashMap as StdHashMap;
    use weft_llm::{MockStreamInputSession, Provider, ProviderRequest, ProviderResponse};
    use weft_types::Role;

    struct DuplexMock {
        elements: std::sync::Mutex<Option<Vec<DuplexElement>>>,
    }

    impl DuplexMock {
        fn new(elements: Vec<DuplexElement>) -> Self {
            Self {
                elements: std::sync::Mutex::new(Some(elements)),
            }
        }
    }

    #[async_trait]
    impl Provider for DuplexMock {
        fn identifier(&self) -> &str {
            "duplex-mock"
        }

        async fn predict(&self, _request: ProviderRequest) -> weft_llm::Result<ProviderResponse> {
            unimplemented!("duplex tests never call predict")
        }

        async fn predict_stream(&self, _request: ProviderRequest) -> weft_llm::Result<weft_llm::ResponseStream> {
            unimplemented!("duplex tests never call predict_stream")
        }

        fn calculate_cost(&self, _input_tokens: u64, _output_tokens: u64, _cached_tokens: u64) -> f64 {
            0.0
        }

        fn duplex_capable(&self) -> Option<&dyn DuplexProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl DuplexProvider for DuplexMock {
        async fn open_duplex_session(
            &self,
            _request: ProviderRequest,
        ) -> weft_llm::Result<Box<dyn StreamInputSession>> {
            let elements = self.elements.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(MockStreamInputSession::new(elements)))
        }
    }

    fn metadata_flag(key: &str) -> StdHashMap<String, Value> {
        let mut m = StdHashMap::new();
        m.insert(key.to_string(), Value::Bool(true));
        m
    }

    #[tokio::test]
    async fn interruption_signals_are_informational_then_tool_calls_pause_for_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(crate::tool::MockTool::new(
            "lookup",
            MockOutcome::Complete(serde_json::json!("42")),
        ));

        let elements = vec![
            DuplexElement {
                metadata: metadata_flag("interrupted"),
                ..Default::default()
            },
            DuplexElement {
                metadata: metadata_flag("interrupted_turn_complete"),
                ..Default::default()
            },
            DuplexElement {
                end_of_stream: true,
                tool_calls: vec![weft_llm::ProviderToolCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({}),
                }],
                ..Default::default()
            },
            DuplexElement {
                end_of_stream: true,
                content: Some("the answer is 42".to_string()),
                ..Default::default()
            },
        ];

        let provider: SharedProvider = Arc::new(DuplexMock::new(elements));
        let mw = Arc::new(DuplexMiddleware::new(provider, "mock-model").with_tool_registry(Arc::new(registry)));

        let mut ctx = ExecutionContext::new();
        ctx.stream_mode = true;
        let (input_tx, input_rx) = tokio::sync::mpsc::channel(1);
        let (output_tx, mut output_rx) = tokio::sync::mpsc::channel(8);
        ctx.stream_input = Some(input_rx);
        ctx.stream_output = Some(output_tx);
        drop(input_tx);

        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        assert!(ctx.messages.iter().any(|m| m.role == Role::Tool));
        assert!(ctx.messages.iter().any(|m| m.role == Role::Assistant && m.content.contains("42")));

        let mut forwarded = Vec::new();
        while let Ok(chunk) = output_rx.try_recv() {
            forwarded.push(chunk);
        }
        assert_eq!(forwarded.len(), 4);
    }

    #[tokio::test]
    async fn empty_terminal_element_is_an_error() {
        let elements = vec![DuplexElement {
            end_of_stream: true,
            ..Default::default()
        }];
        let provider: SharedProvider = Arc::new(DuplexMock::new(elements));
        let mw = Arc::new(DuplexMiddleware::new(provider, "mock-model"));

        let mut ctx = ExecutionContext::new();
        ctx.stream_mode = true;
        let (_input_tx, input_rx) = tokio::sync::mpsc::channel(1);
        let (output_tx, _output_rx) = tokio::sync::mpsc::channel(8);
        ctx.stream_input = Some(input_rx);
        ctx.stream_output = Some(output_tx);

        let chain = Chain::new(vec![mw]);
        let result = chain.process(&mut ctx).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty response"));
    }

    #[tokio::test]
    async fn missing_preconditions_fail_before_next() {
        let provider: SharedProvider = Arc::new(DuplexMock::new(Vec::new()));
        let mw = Arc::new(DuplexMiddleware::new(provider, "mock-model"));
        let mut ctx = ExecutionContext::new();
        let chain = Chain::new(vec![mw]);
        let result = chain.process(&mut ctx).await;
        assert!(result.is_err());
    }
}
