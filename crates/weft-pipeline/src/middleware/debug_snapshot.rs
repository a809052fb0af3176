//! Serializable context dump at labeled stages (spec §4.8, supplement).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;

/// Sink a [`DebugSnapshotMiddleware`] writes labeled snapshots to.
pub trait SnapshotSink: Send + Sync {
    fn record(&self, label: &str, snapshot: Value);
}

/// `Mutex<Vec<..>>`-backed sink for tests and local debugging.
#[derive(Default)]
pub struct InMemorySnapshotSink {
    snapshots: Mutex<Vec<(String, Value)>>,
}

impl InMemorySnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<(String, Value)> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl SnapshotSink for InMemorySnapshotSink {
    fn record(&self, label: &str, snapshot: Value) {
        self.snapshots.lock().unwrap().push((label.to_string(), snapshot));
    }
}

/// Dumps a redacted view of `ExecutionContext` — messages, cost, trace,
/// metadata — before and after `next`, under `"{label}:before"` and
/// `"{label}:after"`. Stream channels and the cancellation handle are
/// omitted since neither is `Serialize`.
pub struct DebugSnapshotMiddleware {
    sink: Arc<dyn SnapshotSink>,
    label: String,
    enabled: bool,
}

impl DebugSnapshotMiddleware {
    pub fn new(sink: Arc<dyn SnapshotSink>, label: impl Into<String>) -> Self {
        Self {
            sink,
            label: label.into(),
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn snapshot(&self, ctx: &ExecutionContext) -> Value {
        let trace: Vec<Value> = ctx
            .trace
            .llm_calls
            .iter()
            .map(|c| {
                json!({
                    "sequence": c.sequence,
                    "message_index": c.message_index,
                    "started_at": c.started_at.to_rfc3339(),
                    "duration_ms": c.duration.as_millis() as u64,
                    "cost": c.cost,
                    "error": c.error,
                })
            })
            .collect();

        json!({
            "system_prompt": ctx.system_prompt,
            "prompt": ctx.prompt,
            "messages": ctx.messages,
            "allowed_tools": ctx.allowed_tools,
            "cost_info": ctx.cost_info,
            "trace": trace,
            "metadata": ctx.metadata_snapshot(),
            "stream_mode": ctx.stream_mode,
            "stream_interrupted": ctx.is_stream_interrupted(),
            "error": ctx.error,
        })
    }
}

#[async_trait]
impl Middleware for DebugSnapshotMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if !self.enabled {
            return next.run(ctx).await;
        }

        self.sink.record(&format!("{}:before", self.label), self.snapshot(ctx));
        let result = next.run(ctx).await;
        self.sink.record(&format!("{}:after", self.label), self.snapshot(ctx));
        result
    }
}
