//! [`MessageStore`] adapter over the SQLite repository.

use std::path::Path;

use async_trait::async_trait;
use casehub_core::{GroupId, MessageId, UserId};
use casehub_hub::{MessageStore, StoreError, StoredMessage};
use tracing::debug;

use crate::connection::{self, ConnectionConfig, ConnectionPool};
use crate::errors::{Result, SqliteStoreError};
use crate::migrations::run_migrations;
use crate::repository::MessageRepo;

/// SQLite-backed message store. Queries run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: ConnectionPool,
}

impl SqliteMessageStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub fn open(path: impl AsRef<Path>, config: &ConnectionConfig) -> Result<Self> {
        let path = path.as_ref();
        connection::ensure_parent_dir(path)?;
        let pool = connection::new_file(path, config)?;
        let applied = run_migrations(&*pool.get()?)?;
        debug!(path = %path.display(), applied, "message store opened");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with migrations applied.
    pub fn in_memory() -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig {
            pool_size: 1,
            ..ConnectionConfig::default()
        })?;
        let _ = run_migrations(&*pool.get()?)?;
        Ok(Self { pool })
    }

    /// Store a message pending delivery to `recipients`.
    pub async fn insert_message(&self, message: StoredMessage, recipients: Vec<UserId>) -> Result<()> {
        self.run(move |conn| MessageRepo::insert_message(conn, &message, &recipients))
            .await
    }

    /// Number of recipients still pending for `id`.
    pub async fn pending_recipients(&self, id: &MessageId) -> Result<usize> {
        let id = id.clone();
        self.run(move |conn| MessageRepo::pending_recipients(conn, &id)).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| SqliteStoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        cursor: Option<&MessageId>,
    ) -> std::result::Result<Vec<StoredMessage>, StoreError> {
        let user = user.clone();
        let cursor = cursor.cloned();
        Ok(self
            .run(move |conn| MessageRepo::undelivered(conn, &user, limit, cursor.as_ref()))
            .await?)
    }

    async fn mark_messages_as_delivered(
        &self,
        group_id: &GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> std::result::Result<(), StoreError> {
        let group_id = group_id.clone();
        let ids = message_ids.to_vec();
        let user = user.clone();
        let changed = self
            .run(move |conn| MessageRepo::mark_delivered(conn, &group_id, &ids, &user))
            .await?;
        debug!(changed, "messages marked delivered");
        Ok(())
    }

    async fn get_message_by_id(&self, id: &MessageId) -> std::result::Result<StoredMessage, StoreError> {
        let key = id.clone();
        self.run(move |conn| MessageRepo::get_by_id(conn, &key))
            .await?
            .ok_or_else(|| StoreError::MessageNotFound(id.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
