//! The shared mutable turn state threaded through the middleware chain
//! (spec §3, "ExecutionContext").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weft_llm::ProviderResponse;
use weft_types::{CostInfo, Message, ToolCallRecord, ToolResultPayload};

/// One chunk flowing through `Middleware::stream_chunk`, and the unit the
/// duplex coordinator reads from/writes to its caller-facing channels.
///
/// Spec §3 describes this as a single discriminated record for both the
/// plain streaming path and the duplex variant (which adds the three
/// trailing fields) rather than two separate types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta_text: Option<String>,
    /// Accumulated content so far (monotonically growing within a turn).
    pub content: Option<String>,
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub media_delta: Option<MediaDelta>,
    /// Present iff this chunk is terminal.
    pub finish_reason: Option<String>,
    pub error: Option<String>,
    pub cost: Option<CostInfo>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Duplex-only: this chunk ends the caller's conversational turn.
    #[serde(default)]
    pub end_of_turn: bool,
    /// Duplex-only: this chunk ends the underlying transport stream.
    #[serde(default)]
    pub end_of_stream: bool,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Inline or referenced media carried by a [`StreamChunk`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDelta {
    pub mime: String,
    pub data: Option<String>,
    pub storage_ref: Option<String>,
}

/// Outcome of one tool invocation (spec §3, "ToolExecutionResult").
#[derive(Debug, Clone)]
pub enum ToolExecutionResult {
    Complete { content: Value },
    Failed { error: String },
    Pending { info: PendingToolInfo },
}

/// Bundle recorded when a tool defers execution pending out-of-band
/// approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolInfo {
    pub tool_call_id: String,
    pub tool_name: String,
    pub reason: String,
    pub message: String,
    pub original_args: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// One provider invocation recorded in the execution trace.
#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub sequence: usize,
    /// Index into `ctx.messages` of the assistant message this call
    /// produced, computed before that message was appended.
    pub message_index: usize,
    pub response: Option<ProviderResponse>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub cost: Option<CostInfo>,
    pub error: Option<String>,
}

/// Ordered record of every provider call made during the turn.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    pub llm_calls: Vec<LlmCallRecord>,
}

impl ExecutionTrace {
    pub fn push(&mut self, record: LlmCallRecord) {
        self.llm_calls.push(record);
    }
}

/// Fire-and-forget lifecycle events (spec §6, "Event emitter").
pub trait EventEmitter: Send + Sync {
    fn conversation_started(&self, _conversation_id: &str) {}
    fn state_loaded(&self, _conversation_id: &str, _message_count: usize) {}
    fn state_saved(&self, _conversation_id: &str, _message_count: usize) {}
    fn tool_call_started(&self, _tool_name: &str) {}
    fn tool_call_completed(&self, _tool_name: &str) {}
    fn tool_call_failed(&self, _tool_name: &str, _error: &str) {}
}

/// The shared mutable state threaded through one turn's middleware chain.
///
/// Latched flags (`stream_interrupted`, the pending-tool set) are behind a
/// `std::sync::Mutex` rather than a plain field because the duplex
/// coordinator's collector task checks them from across an `.await` while
/// the input-forwarder task may also be reading them (spec §5,
/// "Shared-resource policy").
pub struct ExecutionContext {
    pub cancellation: CancellationToken,
    pub system_prompt: String,
    pub variables: HashMap<String, String>,
    pub prompt: String,
    pub messages: Vec<Message>,
    pub allowed_tools: Vec<String>,
    pub tool_results: Vec<ToolResultPayload>,
    pub response: Option<PipelineResponse>,
    pub raw_response: Option<ProviderResponse>,
    pub cost_info: CostInfo,
    pub trace: ExecutionTrace,
    pending_tool_calls: Mutex<Vec<ToolCallRecord>>,
    pub error: Option<String>,
    metadata: Mutex<Option<HashMap<String, Value>>>,
    pub stream_mode: bool,
    pub stream_input: Option<mpsc::Receiver<StreamChunk>>,
    pub stream_output: Option<mpsc::Sender<StreamChunk>>,
    stream_interrupted: Mutex<(bool, Option<String>)>,
    pub event_emitter: Option<Arc<dyn EventEmitter>>,
}

/// The pipeline-level response the caller ultimately observes.
#[derive(Debug, Clone, Default)]
pub struct PipelineResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            system_prompt: String::new(),
            variables: HashMap::new(),
            prompt: String::new(),
            messages: Vec::new(),
            allowed_tools: Vec::new(),
            tool_results: Vec::new(),
            response: None,
            raw_response: None,
            cost_info: CostInfo::default(),
            trace: ExecutionTrace::default(),
            pending_tool_calls: Mutex::new(Vec::new()),
            error: None,
            metadata: Mutex::new(None),
            stream_mode: false,
            stream_input: None,
            stream_output: None,
            stream_interrupted: Mutex::new((false, None)),
            event_emitter: None,
        }
    }

    /// Lazily initialise the metadata bag before first write, then merge
    /// `entries` into it.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let mut guard = self.metadata.lock().unwrap();
        guard.get_or_insert_with(HashMap::new).insert(key.into(), value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.lock().unwrap().as_ref()?.get(key).cloned()
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.metadata.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn merge_metadata(&self, entries: HashMap<String, Value>) {
        let mut guard = self.metadata.lock().unwrap();
        let map = guard.get_or_insert_with(HashMap::new);
        for (k, v) in entries {
            map.insert(k, v);
        }
    }

    /// Append `call` to `metadata["pending_tools"]`, accumulating across
    /// rounds rather than overwriting (spec §9.1 Open Question decision).
    pub fn push_pending_tool(&self, info: PendingToolInfo) {
        let mut guard = self.metadata.lock().unwrap();
        let map = guard.get_or_insert_with(HashMap::new);
        let entry = map.entry("pending_tools".to_string()).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(arr) = entry {
            arr.push(serde_json::to_value(&info).unwrap_or(Value::Null));
        }
    }

    pub fn add_pending_tool_call(&self, call: ToolCallRecord) {
        self.pending_tool_calls.lock().unwrap().push(call);
    }

    pub fn has_pending_tool_calls(&self) -> bool {
        !self.pending_tool_calls.lock().unwrap().is_empty()
    }

    pub fn pending_tool_calls(&self) -> Vec<ToolCallRecord> {
        self.pending_tool_calls.lock().unwrap().clone()
    }

    /// Latch the stream-interrupted flag. Once true, stays true for the
    /// turn: a later call with a different reason does not clear it, it
    /// only has an effect the first time.
    pub fn interrupt_stream(&self, reason: impl Into<String>) {
        let mut guard = self.stream_interrupted.lock().unwrap();
        if !guard.0 {
            *guard = (true, Some(reason.into()));
        }
    }

    pub fn is_stream_interrupted(&self) -> bool {
        self.stream_interrupted.lock().unwrap().0
    }

    pub fn interrupt_reason(&self) -> Option<String> {
        self.stream_interrupted.lock().unwrap().1.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
