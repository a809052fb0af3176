//! Message data model (spec §3).

use serde::{Deserialize, Serialize};

use crate::cost::CostInfo;
use crate::validation::ValidationOutcome;

/// Author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// Which subsystem produced a message.
///
/// Written as `""` (caller input), `"statestore"` (loaded), or `"pipeline"`
/// (generated) so the string form round-trips through `ConversationState`
/// metadata unchanged, matching the externally observable vocabulary in
/// spec §3/§8 scenario S6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Source {
    #[default]
    #[serde(rename = "")]
    Caller,
    #[serde(rename = "statestore")]
    StateStore,
    #[serde(rename = "pipeline")]
    Pipeline,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Caller => "",
            Source::StateStore => "statestore",
            Source::Pipeline => "pipeline",
        }
    }
}

/// A multimodal content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { media: MediaRef },
    Audio { media: MediaRef },
    Video { media: MediaRef },
}

/// Inline media data, or a reference into external storage once the media
/// externalizer (spec §4.7) has offloaded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
    /// Size in bytes, recorded once externalized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
}

impl MediaRef {
    pub fn inline(mime: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            inline_data: Some(data.into()),
            storage_ref: None,
            byte_size: None,
        }
    }

    pub fn is_externalized(&self) -> bool {
        self.storage_ref.is_some()
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    /// Opaque argument bytes (kept as JSON rather than raw bytes since every
    /// provider and tool in this ecosystem speaks JSON).
    pub arguments: serde_json::Value,
}

/// The result of executing one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl ToolResultPayload {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
    #[serde(default)]
    pub source: Source,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: CostInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationOutcome>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_result: None,
            source: Source::Caller,
            timestamp: chrono::Utc::now(),
            latency_ms: 0,
            cost: CostInfo::default(),
            validations: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            ..Message::user(content)
        }
    }

    pub fn tool_result(result: ToolResultPayload) -> Self {
        let content = result.content.clone();
        Self {
            role: Role::Tool,
            content,
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_result: Some(result),
            source: Source::Pipeline,
            timestamp: chrono::Utc::now(),
            latency_ms: 0,
            cost: CostInfo::default(),
            validations: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Invariant: a `Role::Tool` message carries exactly one tool-result.
    pub fn check_tool_invariant(&self) -> bool {
        match self.role {
            Role::Tool => self.tool_result.is_some(),
            _ => self.tool_result.is_none(),
        }
    }
}
