//! The [`Provider`] trait and its capability extensions, plus [`MockProvider`]
//! for deterministic tests.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::Stream;

use crate::error::{ProviderError, Result};
use crate::types::{
    ProviderRequest, ProviderResponse, ProviderToolCall, StopReason, ToolChoice, ToolDescriptor,
    Usage,
};

/// An event emitted during a streaming provider call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart {
        id: String,
        model: String,
    },
    ContentDelta {
        delta: ContentDelta,
    },
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_fragment: String,
    },
    MessageDelta {
        stop_reason: StopReason,
        usage: Usage,
    },
    MessageStop,
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// True for the final event of a message (spec §4.4 streaming round uses
    /// this to find `final_chunk`, the last chunk with a non-nil
    /// finish-reason).
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }
}

/// Delta content within a streaming response.
#[derive(Debug, Clone)]
pub enum ContentDelta {
    Text(String),
}

/// A stream of provider events.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send + 'static>>;

/// Opaque handle returned by [`ToolCapableProvider::build_tooling`], threaded
/// back into `predict_with_tools`.
#[derive(Debug, Clone)]
pub struct ToolingHandle(pub serde_json::Value);

/// Baseline provider capability set (spec §6).
///
/// Capability extensions (`ToolCapableProvider`, `MultimodalProvider`,
/// `DuplexProvider`) are detected through these optional accessors rather
/// than a runtime downcast — "ask the trait object, get `None` if
/// unsupported" instead of matching on a backend enum.
#[async_trait]
pub trait Provider: Send + Sync {
    fn identifier(&self) -> &str;

    async fn predict(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    async fn predict_stream(&self, request: ProviderRequest) -> Result<ResponseStream>;

    fn calculate_cost(&self, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn emits_raw_outputs(&self) -> bool {
        false
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn tool_capable(&self) -> Option<&dyn ToolCapableProvider> {
        None
    }

    fn multimodal_capable(&self) -> Option<&dyn MultimodalProvider> {
        None
    }

    fn duplex_capable(&self) -> Option<&dyn DuplexProvider> {
        None
    }
}

/// Capability extension: native tool calling.
#[async_trait]
pub trait ToolCapableProvider: Provider {
    fn build_tooling(&self, descriptors: &[ToolDescriptor]) -> Result<ToolingHandle>;

    async fn predict_with_tools(
        &self,
        request: ProviderRequest,
        tooling: &ToolingHandle,
        tool_choice: ToolChoice,
    ) -> Result<(ProviderResponse, Vec<ProviderToolCall>)>;
}

/// Capability extension: multimodal (non-text) content.
#[async_trait]
pub trait MultimodalProvider: Provider {
    async fn predict_multimodal(&self, request: ProviderRequest) -> Result<ProviderResponse>;
}

/// Capability extension: bidirectional (WebSocket-like) streaming sessions.
#[async_trait]
pub trait DuplexProvider: Provider {
    async fn open_duplex_session(&self, request: ProviderRequest)
        -> Result<Box<dyn StreamInputSession>>;
}

/// One chunk of inbound media forwarded to a duplex session.
#[derive(Debug, Clone)]
pub struct DuplexMediaChunk {
    pub mime: String,
    pub data: Vec<u8>,
    /// Monotonic sequence, derived from the source chunk's token-count.
    pub sequence: u64,
    pub timestamp: std::time::SystemTime,
    pub is_last: bool,
}

/// One element read from a duplex session's response channel.
///
/// The provider-facing analogue of the pipeline's `StreamChunk` (spec §3) —
/// the duplex coordinator in `weft-pipeline` translates these into pipeline
/// messages the same way the provider middleware translates `StreamEvent`.
#[derive(Debug, Clone, Default)]
pub struct DuplexElement {
    pub content: Option<String>,
    pub tool_calls: Vec<ProviderToolCall>,
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
    pub end_of_stream: bool,
    pub error: Option<String>,
}

/// A live bidirectional session with a duplex-capable provider.
///
/// Modeled with `&self` + interior mutability (mirroring `MockProvider`'s
/// `Mutex`-backed fields) rather than `&mut self`, since the coordinator
/// shares the session between its input-forwarder task and its response
/// collector.
#[async_trait]
pub trait StreamInputSession: Send + Sync {
    async fn send_chunk(&self, chunk: DuplexMediaChunk) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    /// Pull the next response element, or `None` once the session has
    /// closed.
    async fn recv_response(&self) -> Option<DuplexElement>;
}

/// Retry an async operation with exponential backoff. Retries only
/// transient errors; non-retryable errors return immediately.
pub async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    provider_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                last_error = Some(e);
                if attempt < max_retries {
                    tracing::warn!(
                        provider = provider_name,
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap())
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock provider
// ─────────────────────────────────────────────────────────────────────────────

/// A provider backed by a fixed queue of responses, for deterministic tests.
pub struct MockProvider {
    name: String,
    responses: Mutex<Vec<ProviderResponse>>,
    request_log: Mutex<Vec<ProviderRequest>>,
    /// FIFO of fixed costs to return from `calculate_cost`, one per call,
    /// before falling back to the default per-token formula. Lets a test
    /// pin an exact `CostInfo` without hand-deriving it from the formula.
    cost_overrides: Mutex<std::collections::VecDeque<f64>>,
}

impl MockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            name: "mock".to_string(),
            responses: Mutex::new(responses),
            request_log: Mutex::new(Vec::new()),
            cost_overrides: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self::new(vec![ProviderResponse {
            id: "mock_1".into(),
            model: "mock-model".into(),
            text: text.into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: Usage::new(10, 20),
        }])
    }

    /// Queue fixed per-call costs alongside the already-queued responses.
    pub fn with_costs(mut self, costs: Vec<f64>) -> Self {
        self.cost_overrides = Mutex::new(costs.into());
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.request_log.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.request_log.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn predict(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        self.request_log.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(ProviderError::Backend(
                "MockProvider: no more responses queued".to_string(),
            ));
        }
        Ok(responses.remove(0))
    }

    async fn predict_stream(&self, request: ProviderRequest) -> Result<ResponseStream> {
        let response = self.predict(request).await?;

        let mut events = vec![
            StreamEvent::MessageStart {
                id: response.id.clone(),
                model: response.model.clone(),
            },
            StreamEvent::ContentDelta {
                delta: ContentDelta::Text(response.text.clone()),
            },
        ];
        for (index, call) in response.tool_calls.iter().enumerate() {
            events.push(StreamEvent::ToolCallDelta {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_fragment: call.arguments.to_string(),
            });
        }
        events.push(StreamEvent::MessageDelta {
            stop_reason: response.stop_reason,
            usage: response.usage,
        });
        events.push(StreamEvent::MessageStop);

        let events: Vec<Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn calculate_cost(&self, input_tokens: u64, output_tokens: u64, _cached_tokens: u64) -> f64 {
        if let Some(cost) = self.cost_overrides.lock().unwrap().pop_front() {
            return cost;
        }
        input_tokens as f64 * 0.000_001 + output_tokens as f64 * 0.000_002
    }
}

/// A provider shareable across tasks/threads.
pub type SharedProvider = Arc<dyn Provider>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock duplex session
// ─────────────────────────────────────────────────────────────────────────────

/// A duplex session backed by a fixed queue of response elements, for
/// deterministic tests of the duplex coordinator.
pub struct MockStreamInputSession {
    responses: tokio::sync::Mutex<std::collections::VecDeque<DuplexElement>>,
    sent_chunks: Mutex<Vec<DuplexMediaChunk>>,
    sent_text: Mutex<Vec<String>>,
}

impl MockStreamInputSession {
    pub fn new(responses: Vec<DuplexElement>) -> Self {
        Self {
            responses: tokio::sync::Mutex::new(responses.into()),
            sent_chunks: Mutex::new(Vec::new()),
            sent_text: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent_text.lock().unwrap().clone()
    }

    pub fn sent_chunk_count(&self) -> usize {
        self.sent_chunks.lock().unwrap().len()
    }
}

#[async_trait]
impl StreamInputSession for MockStreamInputSession {
    async fn send_chunk(&self, chunk: DuplexMediaChunk) -> Result<()> {
        self.sent_chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.sent_text.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv_response(&self) -> Option<DuplexElement> {
        self.responses.lock().await.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderMessage, ProviderRole};
    use futures::StreamExt;

    fn user_request(model: &str, text: &str) -> ProviderRequest {
        ProviderRequest::new(
            model,
            vec![ProviderMessage {
                role: ProviderRole::User,
                content: text.into(),
                parts: Vec::new(),
                tool_calls: Vec::new(),
                tool_result: None,
            }],
        )
    }

    #[tokio::test]
    async fn single_response() {
        let provider = MockProvider::with_text("hello!");
        let resp = provider.predict(user_request("m", "hi")).await.unwrap();
        assert_eq!(resp.text, "hello!");
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_queue_errors() {
        let provider = MockProvider::new(vec![]);
        let result = provider.predict(user_request("m", "hi")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stream_yields_terminal_event() {
        let provider = MockProvider::with_text("streamed");
        let mut stream = provider
            .predict_stream(user_request("m", "hi"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_retryable() {
        let attempts = Mutex::new(0);
        let result: Result<()> = with_retry(3, std::time::Duration::from_millis(1), "mock", || {
            *attempts.lock().unwrap() += 1;
            async { Err(ProviderError::Config("bad config".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_retries_network_errors() {
        let attempts = Mutex::new(0);
        let result: Result<()> = with_retry(2, std::time::Duration::from_millis(1), "mock", || {
            *attempts.lock().unwrap() += 1;
            async { Err(ProviderError::Network("timeout".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 3);
    }
}
