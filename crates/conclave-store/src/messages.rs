use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use conclave_core::{MessageId, Role, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One transcript turn. Messages are append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a session's transcript.
    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role, len = content.len()))]
    pub fn append(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = row_helpers::now_text();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), role.as_str(), content, now],
            )?;

            Ok(MessageRow {
                id,
                session_id: session_id.clone(),
                role,
                content: content.to_string(),
                timestamp: row_helpers::parse_timestamp(&now, "messages", "timestamp"),
            })
        })
    }

    /// Full transcript, oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, content, timestamp FROM messages
                 WHERE session_id = ?1
                 ORDER BY timestamp ASC, rowid ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn count(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role: String = row_helpers::get(row, 2, "messages", "role")?;
    let timestamp: String = row_helpers::get(row, 4, "messages", "timestamp")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        content: row_helpers::get(row, 3, "messages", "content")?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "messages", "timestamp"),
    })
}
