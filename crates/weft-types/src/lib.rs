//! Core data model shared by the provider layer and the pipeline engine.
//!
//! Pure data: `Serialize` + `Deserialize` + `Clone`, no tokio or async
//! dependency — kept independent of the runtime that consumes it.

pub mod conversation;
pub mod cost;
pub mod message;
pub mod validation;

pub use conversation::ConversationState;
pub use cost::CostInfo;
pub use message::{ContentPart, MediaRef, Message, Role, Source, ToolCallRecord, ToolResultPayload};
pub use validation::ValidationOutcome;
