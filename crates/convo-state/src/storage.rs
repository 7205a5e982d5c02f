use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use convo_core::{DebugInfo, Message, MessageList, Role};

use crate::error::{Result, StateError};

/// Key-value storage kept under `_store` on the conversation's first user
/// message. Writes are pushed to the message store immediately.
pub struct Storage<'a> {
    history: &'a mut MessageList,
    context: &'a mut MessageList,
}

fn is_user(message: &Message) -> bool {
    message.role == Role::User
}

impl<'a> Storage<'a> {
    pub(crate) fn new(history: &'a mut MessageList, context: &'a mut MessageList) -> Self {
        Self { history, context }
    }

    fn target(&self) -> Option<&Message> {
        self.history
            .first_where(is_user)
            .or_else(|| self.context.first_where(is_user))
    }

    fn values(&self) -> Map<String, Value> {
        self.target()
            .and_then(|m| m.debug.get(DebugInfo::STORE))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn keys(&self) -> Vec<String> {
        self.values().keys().cloned().collect()
    }

    pub async fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write(|values| {
            values.insert(key.to_string(), value);
        })
        .await
    }

    /// Remove `key`. Returns whether it was present.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        if self.get(key).is_none() {
            return Ok(false);
        }
        self.write(|values| {
            values.remove(key);
        })
        .await?;
        Ok(true)
    }

    async fn write(&mut self, change: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        let (id, debug) = {
            let target = self
                .target()
                .ok_or_else(|| StateError::Storage("no user message to store values on".to_string()))?;
            let mut values = self.values();
            change(&mut values);
            let mut debug = target.debug.clone();
            debug.set(DebugInfo::STORE, Value::Object(values));
            (target.id.clone(), debug)
        };

        let mut pushed = false;
        for list in [&mut *self.history, &mut *self.context] {
            for message in list.iter_mut().filter(|m| m.id == id) {
                message.debug = debug.clone();
                if !pushed {
                    message.push().await?;
                    pushed = true;
                }
            }
        }
        Ok(())
    }
}
