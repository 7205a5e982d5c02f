use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::debug::DebugInfo;
use crate::error::{CoreError, Result};
use crate::reference::{restore_citations, SourceRef};
use crate::store::{MessageStore, StoredMessage};
use crate::tokenizer::{truncate_text, Tokenizer};

/// Fixed per-message overhead (role and framing) added to every count.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON arguments as emitted by the model.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Parse the arguments; an empty argument string is an empty object.
    pub fn parsed_arguments(&self) -> serde_json::Result<Value> {
        let trimmed = self.function.arguments.trim();
        if trimmed.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(trimmed)
    }
}

/// Where a message lives in the message store.
#[derive(Clone)]
pub struct Remote {
    pub id: String,
    pub chat_id: String,
    store: Option<Arc<dyn MessageStore>>,
}

impl Remote {
    pub fn new(id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id)
            .field("chat_id", &self.chat_id)
            .field("backed", &self.store.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    /// Sources visible to the model when this message was produced.
    pub sources: Vec<SourceRef>,
    /// `[sourceN]` marker to footnote number, filled by citation rewriting.
    pub citations: BTreeMap<String, usize>,
    pub debug: DebugInfo,
    pub remote: Option<Remote>,
    pub is_command: bool,
    pub created_at: DateTime<Utc>,
}

fn looks_like_command(content: Option<&str>) -> bool {
    content
        .map(|c| c.starts_with('!') || c.starts_with('/'))
        .unwrap_or(false)
}

impl Message {
    fn base(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            is_command: looks_like_command(content.as_deref()),
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            sources: Vec::new(),
            citations: BTreeMap::new(),
            debug: DebugInfo::default(),
            remote: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, Some(content.into()))
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::base(Role::Assistant, content);
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::base(Role::Tool, Some(content.into()));
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// Build a message, rejecting role/field combinations no provider accepts.
    pub fn try_new(
        role: Role,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
        tool_call_id: Option<String>,
    ) -> Result<Self> {
        if role == Role::Tool && tool_call_id.is_none() {
            return Err(CoreError::InvalidMessage(
                "tool messages require a tool_call_id".to_string(),
            ));
        }
        if role != Role::Assistant && !tool_calls.is_empty() {
            return Err(CoreError::InvalidMessage(format!(
                "only assistant messages can carry tool calls, got {}",
                role
            )));
        }
        let mut message = Self::base(role, content);
        message.tool_calls = tool_calls;
        message.tool_call_id = tool_call_id;
        Ok(message)
    }

    /// Hydrate a message from the store, restoring the raw `[sourceN]`
    /// markers that citation rewriting replaced with links.
    pub fn from_stored(stored: StoredMessage, store: Option<Arc<dyn MessageStore>>) -> Self {
        let citations: BTreeMap<String, usize> = stored
            .debug
            .get_as(DebugInfo::CITATIONS)
            .unwrap_or_default();
        let sources: Vec<SourceRef> = stored.debug.get_as(DebugInfo::SOURCES).unwrap_or_default();
        let content = stored
            .content
            .map(|c| if citations.is_empty() { c } else { restore_citations(&c, &citations) });

        let mut remote = Remote::new(stored.id.clone(), stored.chat_id);
        if let Some(store) = store {
            remote = remote.with_store(store);
        }

        let mut message = Self::base(stored.role, content);
        message.id = stored.id;
        message.sources = sources;
        message.citations = citations;
        message.debug = stored.debug;
        message.remote = Some(remote);
        message.created_at = stored.created_at;
        message
    }

    pub fn with_sources(mut self, sources: Vec<SourceRef>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_remote(mut self, remote: Remote) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_debug(mut self, debug: DebugInfo) -> Self {
        self.debug = debug;
        self
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty() && self.tool_calls.is_empty()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.id.as_str())
    }

    /// Token ids of the content followed by each tool call's name and arguments.
    pub fn tokens(&self, tokenizer: &dyn Tokenizer) -> Vec<u32> {
        let mut tokens = tokenizer.encode(self.text());
        for call in &self.tool_calls {
            tokens.extend(tokenizer.encode(&call.function.name));
            tokens.extend(tokenizer.encode(&call.function.arguments));
        }
        tokens
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| tokenizer.count(&c.function.name) + tokenizer.count(&c.function.arguments))
            .sum();
        tokenizer.count(self.text()) + calls + MESSAGE_OVERHEAD_TOKENS
    }

    /// Copy with the content cut to `budget` tokens, keeping the tail.
    pub fn truncated(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Self {
        let mut copy = self.clone();
        copy.truncate(budget, tokenizer);
        copy
    }

    pub fn truncate(&mut self, budget: usize, tokenizer: &dyn Tokenizer) {
        if let Some(content) = self.content.as_mut() {
            *content = truncate_text(content, budget, tokenizer);
        }
    }

    /// Replace the content and push it to the store if backed.
    pub async fn update(&mut self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.is_command = looks_like_command(Some(content.as_str()));
        self.content = Some(content);
        self.push().await
    }

    pub async fn append(&mut self, text: &str) -> Result<()> {
        let joined = match self.content.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{}\n\n{}", existing, text),
            _ => text.to_string(),
        };
        self.update(joined).await
    }

    pub async fn prepend(&mut self, text: &str) -> Result<()> {
        let joined = match self.content.as_deref() {
            Some(existing) if !existing.is_empty() => format!("{}\n\n{}", text, existing),
            _ => text.to_string(),
        };
        self.update(joined).await
    }

    /// Set one debug entry and push the snapshot.
    pub async fn set_debug(&mut self, key: &str, value: Value) -> Result<()> {
        self.debug.set(key, value);
        self.push().await
    }

    /// Write content and debug snapshot to the store. Local messages are a no-op.
    pub async fn push(&self) -> Result<()> {
        if let Some(remote) = self.remote.as_ref() {
            if let Some(store) = remote.store() {
                store
                    .update(&remote.id, self.content.as_deref(), &self.debug)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn delete(self) -> Result<()> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CoreError::NoRemote(self.id.clone()))?;
        let store = remote
            .store()
            .ok_or_else(|| CoreError::NoRemote(self.id.clone()))?;
        store.delete(&remote.id).await
    }
}

/// Persisted form of a message produced during a tool loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
}

impl From<&Message> for ToolHistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            sources: message.sources.clone(),
        }
    }
}

impl From<ToolHistoryEntry> for Message {
    fn from(entry: ToolHistoryEntry) -> Self {
        let mut message = Message::base(entry.role, entry.content);
        message.tool_calls = entry.tool_calls;
        message.tool_call_id = entry.tool_call_id;
        message.sources = entry.sources;
        message
    }
}
