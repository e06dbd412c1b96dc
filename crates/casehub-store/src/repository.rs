//! Message repository: SQL for the `messages` and `message_recipients`
//! tables.

use casehub_core::{GroupId, MessageId, UserId};
use casehub_hub::StoredMessage;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{Result, SqliteStoreError};

const SELECT_COLUMNS: &str = "m.id, m.group_id, m.sender_email, m.content, m.created_at";

/// Message repository. Stateless; every method takes `&Connection`.
pub struct MessageRepo;

impl MessageRepo {
    /// Store `message`, pending delivery to each of `recipients`.
    pub fn insert_message(
        conn: &Connection,
        message: &StoredMessage,
        recipients: &[UserId],
    ) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute(
            "INSERT INTO messages (id, group_id, sender_email, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.as_str(),
                message.group_id.as_str(),
                message.sender.as_str(),
                serde_json::to_string(&message.content)?,
                message.created_at.to_rfc3339(),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO message_recipients (message_id, user_email) VALUES (?1, ?2)",
            )?;
            for user in recipients {
                let _ = stmt.execute(params![message.id.as_str(), user.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Up to `limit` messages pending for `user`, in insertion order,
    /// strictly after `cursor` when given. An unknown cursor starts from the
    /// beginning.
    pub fn undelivered(
        conn: &Connection,
        user: &UserId,
        limit: usize,
        cursor: Option<&MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS}
             FROM messages m
             JOIN message_recipients r ON r.message_id = m.id
             WHERE r.user_email = ?1
               AND r.delivered_at IS NULL
               AND m.seq > COALESCE((SELECT seq FROM messages WHERE id = ?2), 0)
             ORDER BY m.seq
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(
                params![user.as_str(), cursor.map(MessageId::as_str), limit],
                Self::map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawMessage::into_message).collect()
    }

    /// Mark `ids` of `group_id` as delivered to `user`. Returns rows changed.
    ///
    /// Ids that belong to another group are ignored.
    pub fn mark_delivered(
        conn: &Connection,
        group_id: &GroupId,
        ids: &[MessageId],
        user: &UserId,
    ) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE message_recipients SET delivered_at = ?1
                 WHERE message_id = ?2 AND user_email = ?3 AND delivered_at IS NULL
                   AND message_id IN (SELECT id FROM messages WHERE group_id = ?4)",
            )?;
            for id in ids {
                changed += stmt.execute(params![now, id.as_str(), user.as_str(), group_id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Fetch one message by ID.
    pub fn get_by_id(conn: &Connection, id: &MessageId) -> Result<Option<StoredMessage>> {
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM messages m WHERE m.id = ?1"),
            params![id.as_str()],
            Self::map_row,
        )
        .optional()?
        .map(RawMessage::into_message)
        .transpose()
    }

    /// Number of recipients still pending for `id`.
    pub fn pending_recipients(conn: &Connection, id: &MessageId) -> Result<usize> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_recipients WHERE message_id = ?1 AND delivered_at IS NULL",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
        Ok(RawMessage {
            id: row.get(0)?,
            group_id: row.get(1)?,
            sender: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

struct RawMessage {
    id: String,
    group_id: String,
    sender: String,
    content: String,
    created_at: String,
}

impl RawMessage {
    fn into_message(self) -> Result<StoredMessage> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| SqliteStoreError::CorruptRow(format!("message {}: {e}", self.id)))?
            .with_timezone(&Utc);
        Ok(StoredMessage {
            id: self.id.into(),
            group_id: self.group_id.into(),
            sender: self.sender.into(),
            content: serde_json::from_str(&self.content)?,
            created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn insert(conn: &Connection, group: &str, recipients: &[&str]) -> StoredMessage {
        let msg = StoredMessage::new(group.into(), "sender@x.io".into(), json!({ "text": group }));
        let recipients: Vec<UserId> = recipients.iter().map(|r| UserId::from(*r)).collect();
        MessageRepo::insert_message(conn, &msg, &recipients).unwrap();
        msg
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let conn = setup();
        let msg = insert(&conn, "G1", &["b"]);
        let loaded = MessageRepo::get_by_id(&conn, &msg.id).unwrap().unwrap();
        assert_eq!(loaded.id, msg.id);
        assert_eq!(loaded.content, json!({ "text": "G1" }));
        assert_eq!(loaded.sender, msg.sender);
        assert_eq!(loaded.created_at.timestamp_millis(), msg.created_at.timestamp_millis());
    }

    #[test]
    fn get_missing_returns_none() {
        let conn = setup();
        assert!(MessageRepo::get_by_id(&conn, &"nope".into()).unwrap().is_none());
    }

    #[test]
    fn undelivered_is_per_user_and_ordered() {
        let conn = setup();
        let first = insert(&conn, "G1", &["a", "b"]);
        let second = insert(&conn, "G2", &["b"]);

        let for_b = MessageRepo::undelivered(&conn, &"b".into(), 10, None).unwrap();
        assert_eq!(
            for_b.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            vec![first.id.clone(), second.id]
        );
        let for_a = MessageRepo::undelivered(&conn, &"a".into(), 10, None).unwrap();
        assert_eq!(for_a.len(), 1);
        assert!(MessageRepo::undelivered(&conn, &"c".into(), 10, None).unwrap().is_empty());
    }

    #[test]
    fn cursor_and_limit_page_forward() {
        let conn = setup();
        let ids: Vec<MessageId> = (0..5).map(|_| insert(&conn, "G1", &["b"]).id).collect();

        let page = MessageRepo::undelivered(&conn, &"b".into(), 2, None).unwrap();
        assert_eq!(page.len(), 2);
        let page = MessageRepo::undelivered(&conn, &"b".into(), 2, Some(&ids[1])).unwrap();
        assert_eq!(page[0].id, ids[2]);
        let page = MessageRepo::undelivered(&conn, &"b".into(), 10, Some(&ids[4])).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn mark_delivered_respects_group_and_user() {
        let conn = setup();
        let msg = insert(&conn, "G1", &["a", "b"]);

        let changed =
            MessageRepo::mark_delivered(&conn, &"G2".into(), &[msg.id.clone()], &"b".into()).unwrap();
        assert_eq!(changed, 0);

        let changed =
            MessageRepo::mark_delivered(&conn, &"G1".into(), &[msg.id.clone()], &"b".into()).unwrap();
        assert_eq!(changed, 1);
        assert!(MessageRepo::undelivered(&conn, &"b".into(), 10, None).unwrap().is_empty());
        assert_eq!(MessageRepo::pending_recipients(&conn, &msg.id).unwrap(), 1);

        let again =
            MessageRepo::mark_delivered(&conn, &"G1".into(), &[msg.id.clone()], &"b".into()).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let conn = setup();
        let msg = insert(&conn, "G1", &["b"]);
        let err = MessageRepo::insert_message(&conn, &msg, &["b".into()]).unwrap_err();
        assert!(matches!(err, SqliteStoreError::Sqlite(_)));
    }
}
