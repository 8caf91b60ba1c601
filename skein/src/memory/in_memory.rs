//! In-memory store: RwLock maps plus cosine scans. Dev and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::store::{
    cosine_similarity, FactRecord, MessageRecord, ScoredMessage, Store, ThreadRecord,
};

#[derive(Default)]
pub struct InMemoryStore {
    threads: RwLock<HashMap<String, ThreadRecord>>,
    /// thread id → messages in append order.
    messages: RwLock<HashMap<String, Vec<MessageRecord>>>,
    facts: RwLock<HashMap<String, FactRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total message count across threads (test helper).
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_thread(&self, thread: ThreadRecord) -> Result<(), StoreError> {
        self.threads.write().await.insert(thread.id.clone(), thread);
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<ThreadRecord>, StoreError> {
        Ok(self.threads.read().await.get(id).cloned())
    }

    async fn append_message(&self, message: MessageRecord) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let thread = messages.entry(message.thread_id.clone()).or_default();
        if thread.iter().any(|m| m.id == message.id) {
            return Ok(()); // idempotent on id
        }
        thread.push(message);
        Ok(())
    }

    async fn recent_messages(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let messages = self.messages.read().await;
        let thread = messages.get(thread_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = thread.len().saturating_sub(limit);
        Ok(thread[start..].to_vec())
    }

    async fn search_messages(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
        exclude_thread: Option<&str>,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut scored: Vec<ScoredMessage> = messages
            .iter()
            .filter(|(thread_id, _)| Some(thread_id.as_str()) != exclude_thread)
            .flat_map(|(_, thread)| thread.iter())
            .filter(|m| m.user_id.as_deref() == Some(user_id))
            .filter_map(|m| {
                let emb = m.embedding.as_ref()?;
                let score = cosine_similarity(emb, embedding);
                (score >= min_score).then(|| ScoredMessage {
                    message: m.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_n);
        Ok(scored)
    }

    async fn upsert_fact(&self, fact: FactRecord) -> Result<(), StoreError> {
        self.facts.write().await.insert(fact.id.clone(), fact);
        Ok(())
    }

    async fn list_facts(
        &self,
        user_id: &str,
        min_confidence: f64,
    ) -> Result<Vec<FactRecord>, StoreError> {
        let facts = self.facts.read().await;
        let mut out: Vec<FactRecord> = facts
            .values()
            .filter(|f| f.user_id == user_id && f.confidence >= min_confidence)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn search_facts(
        &self,
        user_id: &str,
        embedding: &[f32],
        top_n: usize,
        min_score: f32,
    ) -> Result<Vec<(FactRecord, f32)>, StoreError> {
        let facts = self.facts.read().await;
        let mut scored: Vec<(FactRecord, f32)> = facts
            .values()
            .filter(|f| f.user_id == user_id)
            .filter_map(|f| {
                let score = cosine_similarity(&f.embedding, embedding);
                (score >= min_score).then(|| (f.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_n);
        Ok(scored)
    }

    async fn delete_fact(&self, id: &str) -> Result<(), StoreError> {
        self.facts.write().await.remove(id);
        Ok(())
    }
}
