//! Database module
//!
//! Provides persistence for conversations and their message logs.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation. A fresh UUID is assigned when `id` is `None`.
    pub fn create_conversation(
        &self,
        id: Option<&str>,
        title: &str,
        conv_type: ConversationType,
    ) -> DbResult<Conversation> {
        let conn = self.conn()?;
        let conv = Conversation {
            id: id.map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from),
            title: title.to_string(),
            conv_type,
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO conversations (id, title, conv_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                conv.id,
                conv.title,
                conv.conv_type.to_string(),
                conv.created_at.to_rfc3339()
            ],
        )?;

        Ok(conv)
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, conv_type, created_at FROM conversations WHERE id = ?1",
            params![id],
            parse_conversation_row,
        )
        .optional()?
        .ok_or_else(|| DbError::ConversationNotFound(id.to_string()))
    }

    /// Return the conversation with this id, creating it when missing.
    pub fn ensure_conversation(
        &self,
        id: Option<&str>,
        conv_type: ConversationType,
    ) -> DbResult<Conversation> {
        if let Some(id) = id {
            match self.get_conversation(id) {
                Ok(conv) => return Ok(conv),
                Err(DbError::ConversationNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.create_conversation(id, DEFAULT_TITLE, conv_type)
    }

    /// List conversations of one type, newest first
    pub fn list_conversations(
        &self,
        conv_type: ConversationType,
        limit: usize,
    ) -> DbResult<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, conv_type, created_at FROM conversations
             WHERE conv_type = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![conv_type.to_string(), limit], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Delete a conversation and all its messages
    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn()?;

        // Messages are deleted by CASCADE
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;

        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message to a conversation
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> DbResult<Message> {
        let conn = self.conn()?;
        let now = Utc::now();

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO messages (conversation_id, sequence_id, role, content, tool_call_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                sequence_id,
                role.to_string(),
                content,
                tool_call_id,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::ConversationNotFound(conversation_id.to_string())
            }
            other => DbError::Sqlite(other),
        })?;

        Ok(Message {
            id: conn.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            role,
            content: content.map(String::from),
            tool_call_id: tool_call_id.map(String::from),
            created_at: now,
        })
    }

    /// Get all messages for a conversation in replay order
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, role, content, tool_call_id, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get the last `limit` messages for a conversation, still in replay order
    pub fn get_recent_messages(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sequence_id, role, content, tool_call_id, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id DESC LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![conversation_id, limit], parse_message_row)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        conv_type: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(ConversationType::Chat),
        created_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(3)?;
    let role = role_str.parse().unwrap_or_else(|_| {
        tracing::warn!(role = %role_str, "Unknown role in message row, treating as system");
        Role::System
    });

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        role,
        content: row.get(4)?,
        tool_call_id: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
