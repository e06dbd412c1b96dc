//! Message store collaborator contract.
//!
//! The hub never persists message content itself. It reads undelivered
//! messages and writes delivery marks through [`MessageStore`]. The SQLite
//! implementation lives in `casehub-store`; [`MemoryMessageStore`] backs
//! tests and the `memory` backend.

use std::collections::HashSet;

use async_trait::async_trait;
use casehub_core::{GroupId, MessageId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A persisted chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Message ID.
    pub id: MessageId,
    /// Group the message was posted to.
    pub group_id: GroupId,
    /// Original sender.
    #[serde(rename = "sender_email")]
    pub sender: UserId,
    /// Opaque message body.
    pub content: Value,
    /// When the message was stored.
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Build a message stamped now.
    pub fn new(group_id: GroupId, sender: UserId, content: Value) -> Self {
        Self {
            id: MessageId::new(),
            group_id,
            sender,
            content,
            created_at: Utc::now(),
        }
    }

    /// JSON payload used when replaying the message as a chat event.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Errors surfaced by a message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with this ID.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    /// Backend failure (I/O, pool, corrupt row).
    #[error("message store error: {0}")]
    Backend(String),
}

/// Persistent message storage consumed by the delivery tracker.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Up to `limit` messages not yet delivered to `user`, oldest first,
    /// strictly after `cursor` when given.
    async fn get_undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<&MessageId>,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Mark `message_ids` of `group_id` as delivered to `user`.
    async fn mark_messages_as_delivered(
        &self,
        group_id: &GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<(), StoreError>;

    /// Fetch one message.
    async fn get_message_by_id(&self, id: &MessageId) -> Result<StoredMessage, StoreError>;
}

struct Entry {
    message: StoredMessage,
    undelivered: HashSet<UserId>,
}

/// In-process [`MessageStore`]. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryMessageStore {
    entries: RwLock<Vec<Entry>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`, pending delivery to each of `recipients`.
    pub fn insert(&self, message: StoredMessage, recipients: &[UserId]) {
        self.entries.write().push(Entry {
            message,
            undelivered: recipients.iter().cloned().collect(),
        });
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether `message_id` is still pending for `user`.
    pub fn is_pending(&self, message_id: &MessageId, user: &UserId) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| &e.message.id == message_id && e.undelivered.contains(user))
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get_undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<&MessageId>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let entries = self.entries.read();
        let start = match cursor {
            Some(id) => entries
                .iter()
                .position(|e| &e.message.id == id)
                .map_or(0, |pos| pos + 1),
            None => 0,
        };
        Ok(entries[start..]
            .iter()
            .filter(|e| e.undelivered.contains(user))
            .take(limit)
            .map(|e| e.message.clone())
            .collect())
    }

    async fn mark_messages_as_delivered(
        &self,
        group_id: &GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        for entry in entries
            .iter_mut()
            .filter(|e| &e.message.group_id == group_id && message_ids.contains(&e.message.id))
        {
            let _ = entry.undelivered.remove(user);
        }
        Ok(())
    }

    async fn get_message_by_id(&self, id: &MessageId) -> Result<StoredMessage, StoreError> {
        self.entries
            .read()
            .iter()
            .find(|e| &e.message.id == id)
            .map(|e| e.message.clone())
            .ok_or_else(|| StoreError::MessageNotFound(id.clone()))
    }
}
