use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ContentSearch, MessageStore, SearchQuery, StoredMessage};
use crate::error::{CoreError, Result};
use crate::file::{Chunk, ChunkList, File, FileList};
use crate::message::{DebugInfo, Role};

/// Message store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(
        &self,
        chat_id: &str,
        role: Role,
        content: Option<&str>,
        debug: DebugInfo,
    ) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            chat_id: chat_id.to_string(),
            role,
            content: content.map(str::to_string),
            debug,
            created_at: Utc::now(),
        };
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn update(&self, id: &str, content: Option<&str>, debug: &DebugInfo) -> Result<()> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| CoreError::MessageNotFound(id.to_string()))?;
        message.content = content.map(str::to_string);
        message.debug = debug.clone();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| m.id != id);
        if messages.len() == before {
            return Err(CoreError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }
}

/// Term-frequency search over a fixed set of files.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContentSearch {
    files: FileList,
}

impl InMemoryContentSearch {
    pub fn new(files: FileList) -> Self {
        Self { files }
    }

    fn in_scope(&self, query: &SearchQuery) -> Vec<&File> {
        let ids: HashSet<&str> = query.file_ids.iter().map(String::as_str).collect();
        let name = query.name_contains.as_ref().map(|n| n.to_lowercase());
        self.files
            .iter()
            .filter(|f| ids.is_empty() || ids.contains(f.id.as_str()))
            .filter(|f| name.as_ref().map_or(true, |n| f.name.to_lowercase().contains(n)))
            .collect()
    }
}

fn score(chunk: &Chunk, terms: &[String]) -> usize {
    let content = chunk.content.to_lowercase();
    terms.iter().map(|t| content.matches(t.as_str()).count()).sum()
}

#[async_trait::async_trait]
impl ContentSearch for InMemoryContentSearch {
    async fn search(&self, query: &SearchQuery) -> Result<ChunkList> {
        let terms: Vec<String> = query
            .text
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let mut ranked: Vec<(usize, &Chunk)> = self
            .in_scope(query)
            .into_iter()
            .flat_map(|f| f.chunks.iter())
            .map(|c| (score(c, &terms), c))
            .filter(|(s, _)| terms.is_empty() || *s > 0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(ranked.into_iter().take(limit).map(|(_, c)| c.clone()).collect())
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<FileList> {
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(FileList::new(
            self.in_scope(query).into_iter().take(limit).cloned().collect(),
        ))
    }
}
