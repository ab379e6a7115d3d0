//! Message ledger (SQLite): every observed message and whether it has been
//! answered. The only shared mutable state between ingestion and the sweep.

use crate::error::StorageError;
use crate::{Clock, Direction};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row as _, SqlitePool};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Response id recorded when the session could not deliver a reply because
/// its credentials are damaged.
pub const SESSION_CORRUPTED_SENTINEL: &str = "undeliverable:session-corrupted";

/// Response id recorded when a reply kept failing transiently until the
/// attempt ceiling was reached.
pub const RETRY_EXHAUSTED_SENTINEL: &str = "undeliverable:retry-exhausted";

/// A message as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub responded: bool,
    /// Set iff `responded`. Either the id of the reply or a sentinel.
    pub response_id: Option<String>,
    pub response_at: Option<DateTime<Utc>>,
}

/// Fields supplied when recording a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

pub struct MessageLedger {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl MessageLedger {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Open (or create) the ledger file. Writes are fully synced before
    /// returning.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StorageError::Open)?;

        let ledger = Self::new(pool, clock);
        ledger.initialize().await?;
        tracing::info!(path = %path.display(), "message ledger opened");
        Ok(ledger)
    }

    /// Create the messages table and its indexes.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
                body TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                responded INTEGER NOT NULL DEFAULT 0,
                response_id TEXT,
                response_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::query("create messages table"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_pending \
             ON messages (responded, direction, received_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::query("create pending index"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation \
             ON messages (conversation_id, received_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(StorageError::query("create conversation index"))?;

        Ok(())
    }

    /// Persist a message, unresponded. Recording an id that already exists
    /// leaves the stored row untouched.
    pub async fn record(&self, message: &NewMessage) -> Result<String, StorageError> {
        let result = sqlx::query(
            "INSERT INTO messages (id, conversation_id, direction, body, received_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.direction.to_string())
        .bind(&message.body)
        .bind(message.received_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(StorageError::query("record"))?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id = %message.id, "message already recorded");
        }

        Ok(message.id.clone())
    }

    /// Transition `id` to responded if it is not already. Returns whether
    /// this call performed the transition; at most one caller ever gets
    /// `true` for a given id.
    pub async fn mark_responded(
        &self,
        id: &str,
        response_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE messages SET responded = 1, response_id = ?, response_at = ? \
             WHERE id = ? AND responded = 0",
        )
        .bind(response_id)
        .bind(at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::query("mark_responded"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Inbound, unresponded messages at least `older_than` old, oldest first.
    pub async fn find_unanswered(&self, older_than: Duration) -> Result<Vec<Message>, StorageError> {
        let age_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now().timestamp_millis().saturating_sub(age_ms);

        let rows = sqlx::query(
            "SELECT id, conversation_id, direction, body, received_at, responded, response_id, response_at \
             FROM messages \
             WHERE responded = 0 AND direction = 'inbound' AND received_at <= ? \
             ORDER BY received_at ASC, rowid ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::query("find_unanswered"))?;

        rows.iter().map(row_to_message).collect()
    }

    /// Whether `id` has been responded to. Unknown ids are not responded.
    pub async fn is_responded(&self, id: &str) -> Result<bool, StorageError> {
        let responded: Option<i64> =
            sqlx::query_scalar("SELECT responded FROM messages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::query("is_responded"))?;

        Ok(responded.is_some_and(|flag| flag != 0))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>, StorageError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, direction, body, received_at, responded, response_id, response_at \
             FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::query("get"))?;

        row.as_ref().map(row_to_message).transpose()
    }

    /// Most recent messages of a conversation, newest first.
    pub async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, direction, body, received_at, responded, response_id, response_at \
             FROM messages WHERE conversation_id = ? \
             ORDER BY received_at DESC, rowid DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::query("conversation_history"))?;

        rows.iter().map(row_to_message).collect()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StorageError> {
    let id: String = row
        .try_get("id")
        .map_err(StorageError::query("read message id"))?;
    let corrupt = |reason: String| StorageError::CorruptRow {
        id: id.clone(),
        reason,
    };

    let direction = match row
        .try_get::<String, _>("direction")
        .map_err(StorageError::query("read direction"))?
        .as_str()
    {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        other => return Err(corrupt(format!("unknown direction {other:?}"))),
    };

    let received_ms: i64 = row
        .try_get("received_at")
        .map_err(StorageError::query("read received_at"))?;
    let received_at = DateTime::<Utc>::from_timestamp_millis(received_ms)
        .ok_or_else(|| corrupt(format!("received_at out of range: {received_ms}")))?;

    let response_at = row
        .try_get::<Option<i64>, _>("response_at")
        .map_err(StorageError::query("read response_at"))?
        .map(|ms| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("response_at out of range: {ms}")))
        })
        .transpose()?;

    Ok(Message {
        conversation_id: row
            .try_get("conversation_id")
            .map_err(StorageError::query("read conversation_id"))?,
        direction,
        body: row
            .try_get("body")
            .map_err(StorageError::query("read body"))?,
        received_at,
        responded: row
            .try_get::<i64, _>("responded")
            .map_err(StorageError::query("read responded"))?
            != 0,
        response_id: row
            .try_get("response_id")
            .map_err(StorageError::query("read response_id"))?,
        response_at,
        id,
    })
}
