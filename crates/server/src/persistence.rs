//! Persistence layer for sub-chat turns.
//!
//! The orchestrator only needs a read/write contract over one row per turn
//! plus the parent chat's activity timestamp. SQLite access runs on
//! `spawn_blocking`, opening a short-lived connection per call.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

use subchat_protocol::Message;

use crate::migration_runner::run_migrations;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The stored array cannot be read, so it must not be rewritten either
    #[error("stored messages for {turn_id} are unreadable: {reason}")]
    Unreadable { turn_id: String, reason: String },
}

/// What a turn starts from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnSnapshot {
    pub messages: Vec<Message>,
    pub session_id: Option<String>,
}

/// How a write treats the stored backend session id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionIdWrite {
    Keep,
    Set(String),
    Clear,
}

/// Full-row write for a turn. `messages` always replaces the stored array.
#[derive(Debug, Clone)]
pub struct TurnWrite {
    pub chat_id: String,
    pub messages: Vec<Message>,
    pub session_id: SessionIdWrite,
    /// `Some` while a subscription is live, `None` clears the marker
    pub stream_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn load_turn(&self, turn_id: &str) -> Result<TurnSnapshot, StoreError>;
    async fn save_turn(&self, turn_id: &str, write: TurnWrite) -> Result<(), StoreError>;
    async fn touch_chat(&self, chat_id: &str, updated_at: DateTime<Utc>) -> Result<(), StoreError>;
}

pub fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite-backed [`TurnStore`]
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open the database, applying pending migrations.
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        let mut conn = Connection::open(&db_path)?;
        run_migrations(&mut conn)?;
        info!(
            component = "persistence",
            event = "persistence.opened",
            db_path = %db_path.display(),
            "Opened turn store"
        );
        Ok(Self { db_path })
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Streams never survive a restart; clear markers left by a crash.
    pub async fn clear_stale_streams(&self) -> Result<usize, StoreError> {
        let store = self.clone();
        let cleared = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let conn = store.connect()?;
            Ok(conn.execute(
                "UPDATE sub_chats SET stream_id = NULL WHERE stream_id IS NOT NULL",
                [],
            )?)
        })
        .await??;
        if cleared > 0 {
            warn!(
                component = "persistence",
                event = "persistence.stale_streams_cleared",
                count = cleared,
                "Cleared stream markers left by a previous run"
            );
        }
        Ok(cleared)
    }
}

/// Parts this version cannot read load verbatim; anything worse refuses the
/// load so the row is never overwritten with a shorter history.
fn parse_messages(turn_id: &str, raw: &str) -> Result<Vec<Message>, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|e| {
        warn!(
            component = "persistence",
            event = "persistence.messages.unreadable",
            turn_id = %turn_id,
            error = %e,
            "Stored message array is unreadable, leaving it untouched"
        );
        StoreError::Unreadable {
            turn_id: turn_id.to_string(),
            reason: e.to_string(),
        }
    })
}

#[async_trait]
impl TurnStore for SqliteStore {
    async fn load_turn(&self, turn_id: &str) -> Result<TurnSnapshot, StoreError> {
        let store = self.clone();
        let id = turn_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<TurnSnapshot, StoreError> {
            let conn = store.connect()?;
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT messages, session_id FROM sub_chats WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            Ok(match row {
                Some((raw, session_id)) => TurnSnapshot {
                    messages: parse_messages(&id, &raw)?,
                    session_id: session_id.filter(|s| !s.is_empty()),
                },
                None => {
                    debug!(
                        component = "persistence",
                        event = "persistence.turn.missing",
                        turn_id = %id,
                        "No stored row for turn"
                    );
                    TurnSnapshot::default()
                }
            })
        })
        .await?
    }

    async fn save_turn(&self, turn_id: &str, write: TurnWrite) -> Result<(), StoreError> {
        let store = self.clone();
        let id = turn_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = store.connect()?;
            let messages = serde_json::to_string(&write.messages)?;
            let updated_at = iso8601(write.updated_at);

            let (session_mode, session_value) = match &write.session_id {
                SessionIdWrite::Keep => (0, None),
                SessionIdWrite::Set(id) => (1, Some(id.as_str())),
                SessionIdWrite::Clear => (2, None),
            };

            let changed = conn.execute(
                "UPDATE sub_chats SET
                    messages = ?2,
                    session_id = CASE ?3 WHEN 0 THEN session_id ELSE ?4 END,
                    stream_id = ?5,
                    updated_at = ?6
                 WHERE id = ?1",
                params![
                    id,
                    messages,
                    session_mode,
                    session_value,
                    write.stream_id,
                    updated_at
                ],
            )?;

            if changed == 0 {
                conn.execute(
                    "INSERT INTO sub_chats (id, chat_id, messages, session_id, stream_id, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        write.chat_id,
                        messages,
                        session_value,
                        write.stream_id,
                        updated_at
                    ],
                )?;
            }

            debug!(
                component = "persistence",
                event = "persistence.turn.saved",
                turn_id = %id,
                message_count = write.messages.len(),
                streaming = write.stream_id.is_some(),
                "Saved turn"
            );
            Ok(())
        })
        .await?
    }

    async fn touch_chat(&self, chat_id: &str, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let store = self.clone();
        let id = chat_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = store.connect()?;
            conn.execute(
                "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                params![id, iso8601(updated_at)],
            )?;
            Ok(())
        })
        .await?
    }
}
