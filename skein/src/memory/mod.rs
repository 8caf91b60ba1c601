//! Memory & recall surface: conversation history, cross-thread recall,
//! and the per-user fact store.
//!
//! All three layers are additive context. They shape what the model sees
//! at the start of a turn and record the turn afterwards from a detached
//! task; none of them can fail or block the foreground run.

mod embedder;
mod facts;
mod in_memory;
mod sqlite_store;
mod store;

pub use embedder::{Embedder, MockEmbedder, ProviderEmbedder};
pub use facts::{
    decay_sweep, facts_context_block, semantic_upsert, CandidateFact, FactExtractor,
    FACT_CONFIDENCE_BUMP, FACT_MERGE_THRESHOLD, FACT_RETRIEVAL_FLOOR,
};
pub(crate) use facts::strip_code_fence;
pub use in_memory::InMemoryStore;
pub use sqlite_store::SqliteStore;
pub use store::{
    cosine_similarity, FactRecord, MessageRecord, ScoredMessage, Store, ThreadRecord,
};

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::agent::{AgentTask, StepTrace};
use crate::message::{ChatMessage, Role};
use crate::provider::Provider;

/// Cross-thread recall knobs.
#[derive(Clone, Copy, Debug)]
pub struct RecallSettings {
    pub top_n: usize,
    pub min_score: f32,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            top_n: 3,
            min_score: 0.7,
        }
    }
}

/// The memory surface wired into an agent.
pub struct Memory {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn Embedder>>,
    extractor: Option<FactExtractor>,
    max_history: usize,
    max_history_tokens: Option<usize>,
    recall: Option<RecallSettings>,
    fact_context_limit: usize,
}

impl Memory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            embedder: None,
            extractor: None,
            max_history: 20,
            max_history_tokens: None,
            recall: None,
            fact_context_limit: 10,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Enables cross-thread recall (requires an embedder).
    pub fn with_recall(mut self, settings: RecallSettings) -> Self {
        self.recall = Some(settings);
        self
    }

    /// Enables background fact extraction through a secondary provider.
    pub fn with_fact_extraction(mut self, provider: Arc<dyn Provider>) -> Self {
        self.extractor = Some(FactExtractor::new(provider));
        self
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    pub fn with_max_history_tokens(mut self, budget: usize) -> Self {
        self.max_history_tokens = Some(budget);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Context for the start of a turn: fact block, thread history
    /// (trimmed), and cross-thread recall. Failures degrade to less
    /// context, never to an error.
    pub async fn context_messages(&self, task: &AgentTask) -> Vec<ChatMessage> {
        let mut out = Vec::new();

        if let Some(user_id) = &task.user_id {
            if let Some(block) =
                facts_context_block(self.store.as_ref(), user_id, self.fact_context_limit).await
            {
                out.push(ChatMessage::system(block));
            }
        }

        if let Some(thread_id) = &task.thread_id {
            match self
                .store
                .recent_messages(thread_id, self.max_history)
                .await
            {
                Ok(records) => {
                    let mut history: Vec<ChatMessage> = records
                        .into_iter()
                        .filter_map(|r| match r.role {
                            Role::User => Some(ChatMessage::user(r.content)),
                            Role::Assistant => Some(ChatMessage::assistant(r.content)),
                            _ => None,
                        })
                        .collect();
                    if let Some(budget) = self.max_history_tokens {
                        history = trim_to_token_budget(history, budget);
                    }
                    out.extend(history);
                }
                Err(e) => warn!(error = %e, "history load failed, continuing without"),
            }
        }

        if let (Some(recall), Some(embedder), Some(user_id)) =
            (&self.recall, &self.embedder, &task.user_id)
        {
            match embedder.embed(&task.input).await {
                Ok(embedding) => {
                    match self
                        .store
                        .search_messages(
                            user_id,
                            &embedding,
                            recall.top_n,
                            recall.min_score,
                            task.thread_id.as_deref(),
                        )
                        .await
                    {
                        Ok(hits) if !hits.is_empty() => {
                            let mut block =
                                String::from("Relevant context from previous conversations:\n");
                            for hit in &hits {
                                block.push_str(&format!("- {}\n", hit.message.content));
                            }
                            out.push(ChatMessage::system(block));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "recall search failed, continuing without"),
                    }
                }
                Err(e) => warn!(error = %e, "recall embedding failed, continuing without"),
            }
        }

        out
    }

    /// Records a finished turn from a detached task: thread upsert, user
    /// and assistant messages (assistant metadata carries the step
    /// traces), then fact extraction and a decay sweep.
    ///
    /// Message ids derive from (thread, role, content), so replaying the
    /// same turn cannot grow the history. The handle is returned for
    /// tests; callers normally drop it.
    pub fn record_turn(
        self: &Arc<Self>,
        task: &AgentTask,
        output: String,
        steps: Vec<StepTrace>,
    ) -> tokio::task::JoinHandle<()> {
        let memory = Arc::clone(self);
        let input = task.input.clone();
        let thread_id = task.thread_id.clone();
        let user_id = task.user_id.clone();
        tokio::spawn(async move {
            let Some(thread_id) = thread_id else {
                return;
            };
            if let Err(e) = memory
                .write_turn(&thread_id, user_id.as_deref(), &input, &output, steps)
                .await
            {
                warn!(error = %e, thread = %thread_id, "memory write failed");
            }

            if let (Some(extractor), Some(user_id)) = (&memory.extractor, &user_id) {
                match extractor.extract(&input, &output).await {
                    Ok(candidates) => {
                        for candidate in candidates {
                            if let Some(embedder) = &memory.embedder {
                                if let Err(e) = semantic_upsert(
                                    memory.store.as_ref(),
                                    embedder.as_ref(),
                                    user_id,
                                    candidate,
                                )
                                .await
                                {
                                    warn!(error = %e, "fact upsert failed");
                                }
                            }
                        }
                        if let Err(e) =
                            decay_sweep(memory.store.as_ref(), user_id, Utc::now()).await
                        {
                            warn!(error = %e, "fact decay sweep failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "fact extraction failed"),
                }
            }
        })
    }

    async fn write_turn(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
        input: &str,
        output: &str,
        steps: Vec<StepTrace>,
    ) -> Result<(), crate::error::StoreError> {
        if self.store.get_thread(thread_id).await?.is_none() {
            let title: String = input.chars().take(48).collect();
            self.store
                .put_thread(ThreadRecord::new(
                    thread_id,
                    user_id.unwrap_or_default(),
                    title,
                ))
                .await?;
        }

        let user_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(input).await.ok(),
            None => None,
        };
        let assistant_embedding = match &self.embedder {
            Some(embedder) => embedder.embed(output).await.ok(),
            None => None,
        };

        let now = Utc::now();
        self.store
            .append_message(MessageRecord {
                id: message_id(thread_id, Role::User, input),
                thread_id: thread_id.to_string(),
                user_id: user_id.map(String::from),
                role: Role::User,
                content: input.to_string(),
                embedding: user_embedding,
                created_at: now,
                metadata: serde_json::Value::Null,
            })
            .await?;
        self.store
            .append_message(MessageRecord {
                id: message_id(thread_id, Role::Assistant, output),
                thread_id: thread_id.to_string(),
                user_id: user_id.map(String::from),
                role: Role::Assistant,
                content: output.to_string(),
                embedding: assistant_embedding,
                created_at: now,
                metadata: json!({ "step_traces": steps }),
            })
            .await?;
        Ok(())
    }
}

/// Deterministic message id: FNV-1a over (thread, role, content).
fn message_id(thread_id: &str, role: Role, content: &str) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    let role_tag = match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    for byte in thread_id
        .bytes()
        .chain([0u8])
        .chain(role_tag.bytes())
        .chain([0u8])
        .chain(content.bytes())
    {
        h ^= byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("msg-{:016x}", h)
}

/// Keeps the most recent messages that fit the token budget.
fn trim_to_token_budget(history: Vec<ChatMessage>, budget: usize) -> Vec<ChatMessage> {
    let mut kept = Vec::new();
    let mut used = 0;
    for message in history.into_iter().rev() {
        let cost = message.estimate_tokens();
        if used + cost > budget && !kept.is_empty() {
            break;
        }
        used += cost;
        kept.push(message);
    }
    kept.reverse();
    kept
}
