//! Conversation history keyed by session id.
//!
//! A [`SessionStore`] hands out the history for a key, creating it on first
//! reference. Histories are never evicted; they live as long as the store.
//! [`retrieve_context`] is the orchestrator that ties a session to the
//! index: it records the question and returns the formatted search context.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::index::SearchIndex;
use crate::search::{format_documents, search};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

pub type SharedHistory = Arc<Mutex<ChatHistory>>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The history for `key`, created empty on first reference.
    async fn get_or_create(&self, key: &str) -> SharedHistory;

    async fn session_count(&self) -> usize;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SharedHistory>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: &str) -> SharedHistory {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(key.to_string()).or_default())
    }

    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Record `question` in the session and return the retrieval context for
/// it: the top `limit` hits rendered by [`format_documents`].
pub async fn retrieve_context(
    sessions: &dyn SessionStore,
    index: &dyn SearchIndex,
    session: &str,
    question: &str,
    limit: usize,
) -> Result<String> {
    let history = sessions.get_or_create(session).await;
    history.lock().await.push(Role::User, question);

    let hits = search(index, question, limit).await?;
    format_documents(&hits)
}
