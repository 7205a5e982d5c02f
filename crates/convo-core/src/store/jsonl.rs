use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{MessageStore, StoredMessage};
use crate::error::{CoreError, Result};
use crate::message::{DebugInfo, Role};

/// One line of the message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Create {
        message: StoredMessage,
    },
    Update {
        id: String,
        content: Option<String>,
        debug: DebugInfo,
    },
    Delete {
        id: String,
    },
}

/// Append-only message store: every mutation is one JSON line, `list`
/// replays the log.
#[derive(Debug)]
pub struct JsonlMessageStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMessageStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    fn log_path(&self) -> PathBuf {
        self.base_path.join("messages.jsonl")
    }

    async fn append(&self, record: &Record) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn replay(&self) -> Result<Vec<StoredMessage>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut messages: Vec<StoredMessage> = Vec::new();

        while let Some(line) = lines.next_line().await? {
            let record: Record = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping unreadable message log line: {}", e);
                    continue;
                }
            };
            match record {
                Record::Create { message } => messages.push(message),
                Record::Update { id, content, debug } => {
                    if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                        message.content = content;
                        message.debug = debug;
                    }
                }
                Record::Delete { id } => messages.retain(|m| m.id != id),
            }
        }

        Ok(messages)
    }

    async fn ensure_exists(&self, id: &str) -> Result<()> {
        if self.replay().await?.iter().any(|m| m.id == id) {
            Ok(())
        } else {
            Err(CoreError::MessageNotFound(id.to_string()))
        }
    }
}

#[async_trait::async_trait]
impl MessageStore for JsonlMessageStore {
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
        self.append(&Record::Create {
            message: message.clone(),
        })
        .await?;
        Ok(message)
    }

    async fn update(&self, id: &str, content: Option<&str>, debug: &DebugInfo) -> Result<()> {
        self.ensure_exists(id).await?;
        self.append(&Record::Update {
            id: id.to_string(),
            content: content.map(str::to_string),
            debug: debug.clone(),
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_exists(id).await?;
        self.append(&Record::Delete { id: id.to_string() }).await
    }

    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_temp_store() -> Result<(JsonlMessageStore, tempfile::TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let store = JsonlMessageStore::new(temp_dir.path());
        store.init().await?;
        Ok((store, temp_dir))
    }

    #[tokio::test]
    async fn replays_updates_and_deletes() -> Result<()> {
        let (store, _dir) = create_temp_store().await?;

        let user = store.create("chat", Role::User, Some("hi"), DebugInfo::default()).await?;
        let assistant = store.create("chat", Role::Assistant, Some(""), DebugInfo::default()).await?;

        let mut debug = DebugInfo::default();
        debug.set(DebugInfo::STORE, serde_json::json!({"k": "v"}));
        store.update(&user.id, Some("hi!"), &debug).await?;
        store.delete(&assistant.id).await?;

        let listed = store.list("chat").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content.as_deref(), Some("hi!"));
        assert_eq!(listed[0].debug.get(DebugInfo::STORE), Some(&serde_json::json!({"k": "v"})));
        Ok(())
    }

    #[tokio::test]
    async fn survives_reopen() -> Result<()> {
        let (store, dir) = create_temp_store().await?;
        store.create("chat", Role::User, Some("persisted"), DebugInfo::default()).await?;

        let reopened = JsonlMessageStore::new(dir.path());
        let listed = reopened.list("chat").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content.as_deref(), Some("persisted"));
        Ok(())
    }

    #[tokio::test]
    async fn update_unknown_message_fails() -> Result<()> {
        let (store, _dir) = create_temp_store().await?;
        let result = store.update("missing", None, &DebugInfo::default()).await;
        assert!(matches!(result, Err(CoreError::MessageNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn list_of_empty_store_is_empty() -> Result<()> {
        let (store, _dir) = create_temp_store().await?;
        assert!(store.list("nothing").await?.is_empty());
        Ok(())
    }
}
