//! The store collaborator contract: threads, messages, and user facts,
//! with vector search over both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::message::Role;

/// One conversation thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: String,
    /// Owning chat / channel identifier.
    pub chat_id: String,
    pub title: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadRecord {
    pub fn new(id: impl Into<String>, chat_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            title: title.into(),
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One persisted message. `metadata` on assistant messages carries the
/// turn's step traces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// A message scored against a query embedding.
#[derive(Clone, Debug)]
pub struct ScoredMessage {
    pub message: MessageRecord,
    pub score: f32,
}

/// One user fact with decaying confidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactRecord {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub category: String,
    pub confidence: f64,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence collaborator consumed by the memory surface.
///
/// `append_message` is idempotent on the message id: replaying a turn
/// against the same store does not grow the history.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_thread(&self, thread: ThreadRecord) -> Result<(), StoreError>;

    async fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError>;

    async fn append_message(&self, message: MessageRecord) -> Result<(), StoreError>;

    /// The last `limit` messages of a thread, oldest first.
    async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Cosine search over a user's messages across threads, best first.
    /// `exclude_thread` keeps the current conversation out of recall.
    async fn search_messages(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
        exclude_thread: Option<&str>,
    ) -> Result<Vec<ScoredMessage>, StoreError>;

    /// Inserts or replaces a fact by id.
    async fn upsert_fact(&self, fact: FactRecord) -> Result<(), StoreError>;

    /// A user's facts at or above `min_confidence`, newest first.
    async fn list_facts(
        &self,
        user_id: &str,
        min_confidence: f64,
    ) -> Result<Vec<FactRecord>, StoreError>;

    /// Cosine search over a user's facts, best first.
    async fn search_facts(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
    ) -> Result<Vec<(FactRecord, f32)>, StoreError>;

    async fn delete_fact(&self, id: &str) -> Result<(), StoreError>;
}

/// Cosine similarity; dimension mismatches and zero vectors score 0
/// rather than erroring, so recall can never fail a turn.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
