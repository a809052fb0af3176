//! Provider abstraction for the pipeline engine: wire-shaped requests and
//! responses, streaming events, and the [`Provider`] trait family.

pub mod backend;
pub mod error;
pub mod types;

pub use backend::{
    with_retry, ContentDelta, DuplexElement, DuplexMediaChunk, DuplexProvider, MockProvider,
    MockStreamInputSession, MultimodalProvider, Provider, ResponseStream, SharedProvider,
    StreamEvent, StreamInputSession, ToolCapableProvider, ToolingHandle,
};
pub use error::{ProviderError, Result};
pub use types::{
    ProviderMessage, ProviderRequest, ProviderResponse, ProviderRole, ProviderToolCall,
    ProviderToolResult, StopReason, ToolChoice, ToolDescriptor, Usage,
};
