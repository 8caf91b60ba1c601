//! SQLite-backed store. Persistent across process restarts.
//!
//! Rows hold JSON for metadata and embeddings; vector search loads the
//! candidate rows and scores them in process. For single-node and dev;
//! a dedicated vector database stays behind the same [`Store`] trait.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::StoreError;
use crate::message::Role;

use super::store::{
    cosine_similarity, FactRecord, MessageRecord, ScoredMessage, Store, ThreadRecord,
};

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

/// SQLite store: one file, three tables. Opens a connection per operation
/// inside `spawn_blocking` so the async runtime never blocks on disk.
pub struct SqliteStore {
    db_path: std::path::PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(db_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                title TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                user_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding TEXT,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',
                seq INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id);
            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                text TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                embedding TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_facts_user ON facts(user_id);
            "#,
        )
        .map_err(db_err)?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(db_err)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {}", e)))?
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(3)?;
    let embedding: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        user_id: row.get(2)?,
        role: role_from_str(&role),
        content: row.get(4)?,
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
        created_at: parse_ts(&created_at),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, thread_id, user_id, role, content, embedding, created_at, metadata";

#[async_trait]
impl Store for SqliteStore {
    async fn put_thread(&self, thread: ThreadRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&thread.metadata)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO threads (id, chat_id, title, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    thread.id,
                    thread.chat_id,
                    thread.title,
                    metadata,
                    thread.created_at.to_rfc3339(),
                    thread.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, title, metadata, created_at, updated_at
                     FROM threads WHERE id = ?1",
                )
                .map_err(db_err)?;
            let thread = stmt
                .query_row(params![id], |row| {
                    let metadata: String = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    let updated_at: String = row.get(5)?;
                    Ok(ThreadRecord {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        title: row.get(2)?,
                        metadata: serde_json::from_str(&metadata)
                            .unwrap_or(serde_json::Value::Null),
                        created_at: parse_ts(&created_at),
                        updated_at: parse_ts(&updated_at),
                    })
                })
                .ok();
            Ok(thread)
        })
        .await
    }

    async fn append_message(&self, message: MessageRecord) -> Result<(), StoreError> {
        let embedding = message
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&message.metadata)?;
        self.with_conn(move |conn| {
            // INSERT OR IGNORE keeps the append idempotent on id.
            conn.execute(
                "INSERT OR IGNORE INTO messages
                 (id, thread_id, user_id, role, content, embedding, created_at, metadata, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                         (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE thread_id = ?2))",
                params![
                    message.id,
                    message.thread_id,
                    message.user_id,
                    role_to_str(message.role),
                    message.content,
                    embedding,
                    message.created_at.to_rfc3339(),
                    metadata,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM (
                         SELECT {}, seq FROM messages WHERE thread_id = ?1
                         ORDER BY seq DESC LIMIT ?2
                     ) ORDER BY seq ASC",
                    MESSAGE_COLUMNS, MESSAGE_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![thread_id, limit as i64], row_to_message)
                .map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
        .await
    }

    async fn search_messages(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
        exclude_thread: Option<&str>,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let user_id = user_id.to_string();
        let query = embedding.to_vec();
        let exclude = exclude_thread.map(String::from);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM messages WHERE user_id = ?1 AND embedding IS NOT NULL",
                    MESSAGE_COLUMNS
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![user_id], row_to_message)
                .map_err(db_err)?;
            let mut scored: Vec<ScoredMessage> = rows
                .filter_map(|r| r.ok())
                .filter(|m| Some(&m.thread_id) != exclude.as_ref())
                .filter_map(|m| {
                    let emb = m.embedding.as_ref()?;
                    let score = cosine_similarity(emb, &query);
                    (score >= min_score).then(|| ScoredMessage { message: m, score })
                })
                .collect();
            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
            scored.truncate(top_n);
            Ok(scored)
        })
        .await
    }

    async fn upsert_fact(&self, fact: FactRecord) -> Result<(), StoreError> {
        let embedding = serde_json::to_string(&fact.embedding)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO facts
                 (id, user_id, text, category, confidence, embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    fact.id,
                    fact.user_id,
                    fact.text,
                    fact.category,
                    fact.confidence,
                    embedding,
                    fact.created_at.to_rfc3339(),
                    fact.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_facts(
        &self,
        user_id: &str,
        min_confidence: f64,
    ) -> Result<Vec<FactRecord>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, text, category, confidence, embedding, created_at, updated_at
                     FROM facts WHERE user_id = ?1 AND confidence >= ?2
                     ORDER BY updated_at DESC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![user_id, min_confidence], |row| {
                    let embedding: String = row.get(5)?;
                    let created_at: String = row.get(6)?;
                    let updated_at: String = row.get(7)?;
                    Ok(FactRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        text: row.get(2)?,
                        category: row.get(3)?,
                        confidence: row.get(4)?,
                        embedding: serde_json::from_str(&embedding).unwrap_or_default(),
                        created_at: parse_ts(&created_at),
                        updated_at: parse_ts(&updated_at),
                    })
                })
                .map_err(db_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
        })
        .await
    }

    async fn search_facts(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
    ) -> Result<Vec<(FactRecord, f32)>, StoreError> {
        let query = embedding.to_vec();
        let facts = self.list_facts(user_id, 0.0).await?;
        let mut scored: Vec<(FactRecord, f32)> = facts
            .into_iter()
            .filter_map(|f| {
                let score = cosine_similarity(&f.embedding, &query);
                (score >= min_score).then_some((f, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_n);
        Ok(scored)
    }

    async fn delete_fact(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM facts WHERE id = ?1", params![id])
                .map_err(db_err)?;
            Ok(())
        })
        .await
    }
}
