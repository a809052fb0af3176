//! Persisted conversation state (spec §3, "ConversationState (persisted)").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// The record a `StateStore` loads and saves.
///
/// Loaded by state-store-load and never mutated by it; reconstructed (not
/// merged) by state-store-save from the final context messages and
/// accumulated cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: String,
    pub user_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationState {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            messages: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}
