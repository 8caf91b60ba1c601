//! User facts: extraction, semantic upsert, and decay.
//!
//! A secondary provider proposes candidate facts after each turn. Facts
//! merge by embedding similarity rather than exact id: a close-enough
//! existing fact gets its text refreshed and confidence bumped instead of
//! a duplicate row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AgentError, StoreError};
use crate::message::{ChatMessage, ChatRequest};
use crate::provider::Provider;

use super::embedder::Embedder;
use super::store::{FactRecord, Store};

/// Similarity at or above which a candidate merges into an existing fact.
pub const FACT_MERGE_THRESHOLD: f32 = 0.85;
/// Confidence bump applied on merge, capped at 1.0.
pub const FACT_CONFIDENCE_BUMP: f64 = 0.1;
/// Facts below this confidence are never retrieved.
pub const FACT_RETRIEVAL_FLOOR: f64 = 0.3;
/// Per-sweep decay multiplier for facts older than [`FACT_DECAY_AFTER_DAYS`].
pub const FACT_DECAY_FACTOR: f64 = 0.95;
pub const FACT_DECAY_AFTER_DAYS: i64 = 7;
/// Facts under the floor and older than this are deleted on sweep.
pub const FACT_DELETE_AFTER_DAYS: i64 = 30;

/// A fact proposed by the extractor, before upsert.
#[derive(Clone, Debug, Deserialize)]
pub struct CandidateFact {
    pub text: String,
    #[serde(default)]
    pub category: String,
    pub confidence: f64,
}

const EXTRACTION_PROMPT: &str = "You extract durable facts about the user from a conversation \
turn. Reply with a JSON array (possibly empty) of objects \
{\"text\", \"category\", \"confidence\"} where confidence is in [0,1]. \
Only long-lived facts (preferences, biography, projects); never \
conversation mechanics. Reply with JSON only.";

/// Asks a secondary provider for candidate facts from one turn.
pub struct FactExtractor {
    provider: Arc<dyn Provider>,
}

impl FactExtractor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub async fn extract(
        &self,
        user_input: &str,
        assistant_output: &str,
    ) -> Result<Vec<CandidateFact>, AgentError> {
        let turn = format!("user: {}\nassistant: {}", user_input, assistant_output);
        let request = ChatRequest::new(vec![
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(turn),
        ]);
        let response = self.provider.chat(&request).await?;
        let body = strip_code_fence(&response.content);
        let candidates: Vec<CandidateFact> = match serde_json::from_str(body) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "fact extractor reply was not valid JSON, ignoring");
                Vec::new()
            }
        };
        Ok(candidates
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .map(|mut c| {
                c.confidence = c.confidence.clamp(0.0, 1.0);
                c
            })
            .collect())
    }
}

pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Inserts the candidate or merges it into the closest existing fact.
///
/// Merge when cosine ≥ [`FACT_MERGE_THRESHOLD`]: text and embedding are
/// refreshed, confidence becomes `min(1.0, existing + 0.1)`. Otherwise a
/// new fact is inserted with the candidate's own confidence.
pub async fn semantic_upsert(
    store: &dyn Store,
    embedder: &dyn Embedder,
    user_id: &str,
    candidate: CandidateFact,
) -> Result<(), StoreError> {
    let embedding = embedder.embed(&candidate.text).await?;
    let hits = store
        .search_facts(user_id, &embedding, 1, FACT_MERGE_THRESHOLD)
        .await?;

    if let Some((existing, score)) = hits.into_iter().next() {
        debug!(fact = %existing.id, score, "merging candidate into existing fact");
        let merged = FactRecord {
            text: candidate.text,
            category: if candidate.category.is_empty() {
                existing.category.clone()
            } else {
                candidate.category
            },
            confidence: (existing.confidence + FACT_CONFIDENCE_BUMP).min(1.0),
            embedding,
            updated_at: Utc::now(),
            ..existing
        };
        store.upsert_fact(merged).await
    } else {
        store
            .upsert_fact(FactRecord {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                text: candidate.text,
                category: candidate.category,
                confidence: candidate.confidence,
                embedding,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
    }
}

/// One decay sweep over a user's facts.
///
/// Facts older than 7 days decay by ×0.95; facts under the retrieval
/// floor and older than 30 days are deleted. Returns the delete count.
pub async fn decay_sweep(
    store: &dyn Store,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let mut deleted = 0;
    for fact in store.list_facts(user_id, 0.0).await? {
        let age = now - fact.created_at;
        if age < Duration::days(FACT_DECAY_AFTER_DAYS) {
            continue;
        }
        let decayed = fact.confidence * FACT_DECAY_FACTOR;
        if decayed < FACT_RETRIEVAL_FLOOR && age >= Duration::days(FACT_DELETE_AFTER_DAYS) {
            store.delete_fact(&fact.id).await?;
            deleted += 1;
        } else {
            store
                .upsert_fact(FactRecord {
                    confidence: decayed,
                    ..fact
                })
                .await?;
        }
    }
    if deleted > 0 {
        debug!(user = user_id, deleted, "fact decay sweep removed stale facts");
    }
    Ok(deleted)
}

/// Renders retrievable facts as the context block injected into prompts.
/// `None` when the user has no facts above the floor.
pub async fn facts_context_block(
    store: &dyn Store,
    user_id: &str,
    limit: usize,
) -> Option<String> {
    let facts = match store.list_facts(user_id, FACT_RETRIEVAL_FLOOR).await {
        Ok(facts) => facts,
        Err(e) => {
            warn!(error = %e, "fact lookup failed, continuing without");
            return None;
        }
    };
    if facts.is_empty() {
        return None;
    }
    let mut block = String::from("Known facts about the user:\n");
    for fact in facts.iter().take(limit) {
        block.push_str(&format!("- {} ({})\n", fact.text, fact.category));
    }
    Some(block)
}
