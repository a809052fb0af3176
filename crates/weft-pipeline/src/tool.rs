//! Tool invocation interface (spec §4.4.1 / §6).
//!
//! No concrete tool bodies — only the registry contract and a `MockTool` for
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{PendingToolInfo, ToolExecutionResult};
use weft_llm::ToolDescriptor;

/// Execution context handed to a tool: cancellation plus any ambient info a
/// real tool body would need (conversation/session ids, output sink). Kept
/// minimal since tool bodies are out of scope (spec §1, non-goals).
#[derive(Clone)]
pub struct ToolContext {
    pub cancellation: CancellationToken,
    pub conversation_id: Option<String>,
}

impl ToolContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            conversation_id: None,
        }
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// A tool the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Invoke the tool. All tools go through the async path — a
    /// synchronous tool just always returns `Complete` (spec §9, "Tool
    /// registry as async by default").
    async fn execute_async(&self, args: Value, ctx: &ToolContext) -> ToolExecutionResult;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Registry of tools available to a turn.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Fetch descriptors for the given names, skipping any not registered.
    pub fn get_tools_by_names(&self, names: &[String]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| t.descriptor()))
            .collect()
    }

    pub async fn execute_async(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> ToolExecutionResult {
        match self.tools.get(name) {
            Some(tool) => tool.execute_async(args, ctx).await,
            None => ToolExecutionResult::Failed {
                error: format!("tool not registered: {name}"),
            },
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call outcome a [`MockTool`] is configured to return.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Complete(Value),
    Failed(String),
    Pending { reason: String, message: String },
}

/// A tool with a fixed, configurable outcome, for tests.
pub struct MockTool {
    name: String,
    outcome: Mutex<MockOutcome>,
}

impl MockTool {
    pub fn new(name: impl Into<String>, outcome: MockOutcome) -> Self {
        Self {
            name: name.into(),
            outcome: Mutex::new(outcome),
        }
    }

    pub fn complete(name: impl Into<String>, content: Value) -> Self {
        Self::new(name, MockOutcome::Complete(content))
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool for tests"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute_async(&self, args: Value, _ctx: &ToolContext) -> ToolExecutionResult {
        match &*self.outcome.lock().unwrap() {
            MockOutcome::Complete(content) => ToolExecutionResult::Complete {
                content: content.clone(),
            },
            MockOutcome::Failed(err) => ToolExecutionResult::Failed { error: err.clone() },
            MockOutcome::Pending { reason, message } => ToolExecutionResult::Pending {
                info: PendingToolInfo {
                    tool_call_id: String::new(),
                    tool_name: self.name.clone(),
                    reason: reason.clone(),
                    message: message.clone(),
                    original_args: args,
                    metadata: HashMap::new(),
                },
            },
        }
    }
}
