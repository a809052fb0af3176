//! Offloads large inline media to a blob store after `next` (spec §4.7).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::Result;
use weft_types::{ContentPart, Message};

/// A reference returned by a media-storage backend once a blob is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef(pub String);

/// Minimal storage contract a real blob service would implement (spec
/// §4.7.1, supplement — the spec text assumes a "media-storage service"
/// without naming its shape).
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], mime: &str) -> std::result::Result<StorageRef, String>;
}

/// `Mutex<HashMap>`-backed store for tests, keyed by the same composite key
/// the externalizer builds.
#[derive(Default)]
pub struct InMemoryMediaStore {
    blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.blobs.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(&self, key: &str, bytes: &[u8], mime: &str) -> std::result::Result<StorageRef, String> {
        self.blobs.lock().unwrap().insert(key.to_string(), (bytes.to_vec(), mime.to_string()));
        Ok(StorageRef(format!("blob://{key}")))
    }
}

/// Offloads inline media parts of the response above `threshold_kb` to a
/// [`MediaStore`], keyed by run/session/conversation/message-index/part-index
/// /mime/timestamp/policy, replacing inline data with the returned reference.
pub struct MediaExternalizerMiddleware {
    store: std::sync::Arc<dyn MediaStore>,
    run_id: String,
    session_id: String,
    policy: String,
    threshold_kb: u64,
    enabled: bool,
}

impl MediaExternalizerMiddleware {
    pub fn new(store: std::sync::Arc<dyn MediaStore>, run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            session_id: session_id.into(),
            policy: "default".to_string(),
            threshold_kb: 32,
            enabled: true,
        }
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = policy.into();
        self
    }

    pub fn with_threshold_kb(mut self, threshold_kb: u64) -> Self {
        self.threshold_kb = threshold_kb;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    async fn externalize_message(&self, conversation_id: &str, message_index: usize, message: &mut Message) {
        for (part_index, part) in message.parts.iter_mut().enumerate() {
            let media = match part {
                ContentPart::Image { media } | ContentPart::Audio { media } | ContentPart::Video { media } => media,
                ContentPart::Text { .. } => continue,
            };

            if media.storage_ref.is_some() {
                continue;
            }
            let Some(data) = &media.inline_data else { continue };

            let decoded = match BASE64.decode(data) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            // `decoded` is already the post-base64 byte vector, so its length
            // *is* the byte size the threshold is measured against. The
            // 3/4 ratio only applies when converting a base64 *string*
            // length to a byte count, not here.
            let size_kb = decoded.len() as u64 / 1024;
            if size_kb < self.threshold_kb {
                continue;
            }

            let key = format!(
                "{}/{}/{}/{}/{}/{}/{}/{}",
                self.run_id,
                self.session_id,
                conversation_id,
                message_index,
                part_index,
                media.mime,
                Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                self.policy,
            );

            match self.store.put(&key, &decoded, &media.mime).await {
                Ok(storage_ref) => {
                    media.storage_ref = Some(storage_ref.0);
                    media.inline_data = None;
                    media.byte_size = Some(decoded.len() as u64);
                }
                Err(err) => {
                    tracing::warn!(error = %err, key, "media externalization failed");
                }
            }
        }
    }
}

#[async_trait]
impl Middleware for MediaExternalizerMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let result = next.run(ctx).await;

        if self.enabled && result.is_ok() && ctx.error.is_none() {
            let conversation_id = ctx
                .get_metadata("conversation_id")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();

            if ctx.response.is_some() {
                let indices: Vec<usize> = ctx.trace.llm_calls.iter().map(|c| c.message_index).collect();
                for index in indices {
                    if let Some(message) = ctx.messages.get_mut(index) {
                        if message.role == weft_types::Role::Assistant {
                            self.externalize_message(&conversation_id, index, message).await;
                        }
                    }
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use weft_types::{ContentPart, MediaRef, Role, Source};

    fn big_inline_media() -> MediaRef {
        let raw = vec![7u8; 64 * 1024];
        MediaRef::inline("image/png", BASE64.encode(raw))
    }

    #[tokio::test]
    async fn externalizes_large_inline_media_and_records_size() {
        let store = std::sync::Arc::new(InMemoryMediaStore::new());
        let mw = std::sync::Arc::new(MediaExternalizerMiddleware::new(store.clone(), "run1", "sess1"));

        let mut ctx = ExecutionContext::new();
        ctx.set_metadata("conversation_id", Value::String("conv1".into()));
        let mut msg = Message::assistant("look at this");
        msg.role = Role::Assistant;
        msg.source = Source::Pipeline;
        msg.parts.push(ContentPart::Image { media: big_inline_media() });
        ctx.messages.push(msg);
        ctx.response = Some(crate::context::PipelineResponse::default());
        ctx.trace.push(crate::context::LlmCallRecord {
            sequence: 1,
            message_index: 0,
            response: None,
            started_at: Utc::now(),
            duration: std::time::Duration::from_millis(1),
            cost: None,
            error: None,
        });

        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        let ContentPart::Image { media } = &ctx.messages[0].parts[0] else {
            panic!("expected image part")
        };
        assert!(media.is_externalized());
        assert!(media.inline_data.is_none());
        assert_eq!(media.byte_size, Some(64 * 1024));
    }

    #[tokio::test]
    async fn leaves_small_media_inline() {
        let store = std::sync::Arc::new(InMemoryMediaStore::new());
        let mw = std::sync::Arc::new(MediaExternalizerMiddleware::new(store.clone(), "run1", "sess1").with_threshold_kb(1000));

        let mut ctx = ExecutionContext::new();
        let mut msg = Message::assistant("small");
        msg.parts.push(ContentPart::Image { media: big_inline_media() });
        ctx.messages.push(msg);
        ctx.response = Some(crate::context::PipelineResponse::default());
        ctx.trace.push(crate::context::LlmCallRecord {
            sequence: 1,
            message_index: 0,
            response: None,
            started_at: Utc::now(),
            duration: std::time::Duration::from_millis(1),
            cost: None,
            error: None,
        });

        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        let ContentPart::Image { media } = &ctx.messages[0].parts[0] else {
            panic!("expected image part")
        };
        assert!(!media.is_externalized());
    }
}
