//! Seams to the chat platform: message persistence and content search.

pub mod jsonl;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::file::{ChunkList, FileList};
use crate::message::{DebugInfo, Role};

pub use jsonl::JsonlMessageStore;
pub use memory::{InMemoryContentSearch, InMemoryMessageStore};

/// A message as the store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub debug: DebugInfo,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(
        &self,
        chat_id: &str,
        role: Role,
        content: Option<&str>,
        debug: DebugInfo,
    ) -> Result<StoredMessage>;

    async fn update(&self, id: &str, content: Option<&str>, debug: &DebugInfo) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Messages of a chat in creation order.
    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>>;
}

/// Text and structured filters for [`ContentSearch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub text: Option<String>,
    /// Restrict to these file ids; empty means every file in scope.
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[async_trait::async_trait]
pub trait ContentSearch: Send + Sync {
    /// Ranked chunks matching the query.
    async fn search(&self, query: &SearchQuery) -> Result<ChunkList>;

    /// Whole files matching the structured part of the query.
    async fn fetch(&self, query: &SearchQuery) -> Result<FileList>;
}

/// The request a module is invoked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub company_id: String,
    #[serde(default)]
    pub assistant_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
    #[serde(default)]
    pub user_message_text: String,
    /// Per-event configuration overrides.
    #[serde(default)]
    pub configuration: Map<String, Value>,
}
