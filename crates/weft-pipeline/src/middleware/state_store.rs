//! Conversation persistence: load before `next`, save after (spec §4.3).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chain::{Middleware, Next};
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use weft_types::{ConversationState, Source};

/// Persistence contract for conversation state (spec §6).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, id: &str) -> std::result::Result<Option<ConversationState>, String>;
    async fn save(&self, state: ConversationState) -> std::result::Result<(), String>;
}

/// `Mutex<HashMap<..>>`-backed store for tests and in-process use (spec
/// §4.3.1, supplement).
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, ConversationState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, id: &str) -> std::result::Result<Option<ConversationState>, String> {
        Ok(self.states.lock().unwrap().get(id).cloned())
    }

    async fn save(&self, state: ConversationState) -> std::result::Result<(), String> {
        self.states.lock().unwrap().insert(state.id.clone(), state);
        Ok(())
    }
}

/// Loads prior history before `next`, persists the final state after.
pub struct StateStoreMiddleware {
    store: Arc<dyn StateStore>,
    conversation_id: String,
    user_id: String,
    config_metadata: HashMap<String, Value>,
}

impl StateStoreMiddleware {
    pub fn new(store: Arc<dyn StateStore>, conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            config_metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.config_metadata = metadata;
        self
    }
}

#[async_trait]
impl Middleware for StateStoreMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let loaded = self
            .store
            .load(&self.conversation_id)
            .await
            .map_err(PipelineError::Configuration)?;

        let is_first_turn = loaded.is_none();

        if let Some(state) = &loaded {
            let mut stamped: Vec<_> = state
                .messages
                .iter()
                .cloned()
                .map(|mut m| {
                    m.source = Source::StateStore;
                    m
                })
                .collect();
            stamped.extend(std::mem::take(&mut ctx.messages));
            ctx.messages = stamped;
        }

        ctx.set_metadata("conversation_id", Value::String(self.conversation_id.clone()));
        ctx.set_metadata("user_id", Value::String(self.user_id.clone()));
        ctx.merge_metadata(self.config_metadata.clone());

        if let Some(emitter) = &ctx.event_emitter {
            emitter.state_loaded(&self.conversation_id, ctx.messages.len());
            if is_first_turn && !ctx.prompt.is_empty() {
                emitter.conversation_started(&self.conversation_id);
            }
        }

        let next_result = next.run(ctx).await;

        let mut metadata = loaded.map(|s| s.metadata).unwrap_or_default();
        for (key, value) in ctx.metadata_snapshot() {
            metadata.insert(key, value);
        }
        if ctx.cost_info.total_cost_usd > 0.0 {
            metadata.insert("total_cost_usd".to_string(), json!(ctx.cost_info.total_cost_usd));
            metadata.insert("total_tokens".to_string(), json!(ctx.cost_info.total_tokens()));
        }

        let state = ConversationState {
            id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            messages: ctx.messages.clone(),
            metadata,
        };
        let save_result = self.store.save(state).await.map_err(PipelineError::Configuration);

        if let Some(emitter) = &ctx.event_emitter {
            emitter.state_saved(&self.conversation_id, ctx.messages.len());
        }

        match next_result {
            Err(err) => Err(err),
            Ok(()) => save_result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use std::sync::Arc as StdArc;
    use weft_types::Message;

    #[tokio::test]
    async fn load_prepends_statestore_messages_without_mutating_original() {
        let store = StdArc::new(InMemoryStateStore::new());
        let mut seeded = ConversationState::new("conv1", "user1");
        seeded.messages.push(Message::user("earlier"));
        store.save(seeded.clone()).await.unwrap();

        let mw = StdArc::new(StateStoreMiddleware::new(store.clone(), "conv1", "user1"));
        let mut ctx = ExecutionContext::new();
        ctx.messages.push(Message::user("new message"));
        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].source, Source::StateStore);
        assert_eq!(ctx.messages[1].content, "new message");
        assert_eq!(seeded.messages[0].source, Source::Caller);
    }

    #[tokio::test]
    async fn save_runs_and_reconstructs_state_even_on_downstream_error() {
        struct Failing;
        #[async_trait]
        impl Middleware for Failing {
            async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
                ctx.messages.push(Message::assistant("partial"));
                let _ = next.run(ctx).await;
                Err(PipelineError::Internal("boom".to_string()))
            }
        }

        let store = StdArc::new(InMemoryStateStore::new());
        let state_mw = StdArc::new(StateStoreMiddleware::new(store.clone(), "conv2", "user1"));
        let mut ctx = ExecutionContext::new();
        let chain = Chain::new(vec![state_mw, StdArc::new(Failing)]);
        let result = chain.process(&mut ctx).await;

        assert!(result.is_err());
        let saved = store.load("conv2").await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 1);
    }

    #[tokio::test]
    async fn round_trip_load_append_save_load() {
        let store = StdArc::new(InMemoryStateStore::new());
        let mw = StdArc::new(StateStoreMiddleware::new(store.clone(), "conv3", "user1"));
        let mut ctx = ExecutionContext::new();
        ctx.messages.push(Message::user("hi"));
        let chain = Chain::new(vec![mw]);
        chain.process(&mut ctx).await.unwrap();

        let reloaded = store.load("conv3").await.unwrap().unwrap();
        assert_eq!(reloaded.messages.len(), ctx.messages.len());
        assert_eq!(reloaded.messages[0].content, ctx.messages[0].content);
    }
}
