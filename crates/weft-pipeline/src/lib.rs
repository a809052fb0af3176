//! Middleware chain engine: execution context, provider loop, duplex
//! coordinator, and streaming validator (spec §2/§4).
//!
//! A caller assembles a [`chain::Chain`] from an ordered list of
//! [`chain::Middleware`] implementations and drives it with
//! [`context::ExecutionContext`]. The concrete middlewares in [`middleware`]
//! cover prompt assembly, templating, variable resolution, context-budget
//! truncation, state-store load/save, the provider round loop (and its
//! streaming and duplex variants), streaming validation, media
//! externalization, and debug snapshots.

pub mod chain;
pub mod context;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod tool;

pub use chain::{Chain, Middleware, Next};
pub use context::{
    EventEmitter, ExecutionContext, ExecutionTrace, LlmCallRecord, MediaDelta, PendingToolInfo,
    PipelineResponse, StreamChunk, ToolExecutionResult,
};
pub use error::{PipelineError, Result};
pub use middleware::context_budget::{ContextBudgetMiddleware, ContextBudgetPolicy, TruncationStrategy};
pub use middleware::debug_snapshot::{DebugSnapshotMiddleware, InMemorySnapshotSink, SnapshotSink};
pub use middleware::duplex::DuplexMiddleware;
pub use middleware::media_externalizer::{InMemoryMediaStore, MediaExternalizerMiddleware, MediaStore, StorageRef};
pub use middleware::prompt_assembly::{PromptAssemblyMiddleware, PromptConfig, PromptRegistry};
pub use middleware::provider::{ProviderMiddleware, RoundPolicy};
pub use middleware::state_store::{InMemoryStateStore, StateStore, StateStoreMiddleware};
pub use middleware::streaming_validator::{
    BannedWordsValidator, MaxLengthValidator, ProbeValidator, StreamingValidator,
    StreamingValidatorMiddleware, ValidationError, ValidatorConfig,
};
pub use middleware::template::TemplateMiddleware;
pub use middleware::variables::{VariableProvider, VariableProviderMiddleware};
pub use tool::{MockOutcome, MockTool, Tool, ToolContext, ToolRegistry};
