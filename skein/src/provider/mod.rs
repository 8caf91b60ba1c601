//! Provider contract: the chat / chat-stream operations a language-model
//! backend implements, plus embedding.
//!
//! Concrete HTTP adapters live outside this crate; the runtime only sees
//! these traits. Decorators compose by wrapping:
//! `telemetry(rate_limit(retry(provider)))` — see [`decorate`].

mod mock;
mod rate_limit;
mod retry;
mod telemetry;

pub use mock::MockProvider;
pub use rate_limit::RateLimitProvider;
pub use retry::{RetryConfig, RetryProvider};
pub use telemetry::TelemetryProvider;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{ChatRequest, ChatResponse};

/// Incremental output from a streaming chat call.
#[derive(Clone, Debug)]
pub enum ProviderDelta {
    /// A chunk of assistant text.
    Text { content: String },
    /// A chunk of model reasoning, for backends that expose it.
    Thinking { content: String },
    /// A chunk of tool-call arguments, keyed by the provider's call id.
    /// `id` and `name` are present on the first chunk of each call.
    ToolCall {
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
}

/// A chat-completion backend.
///
/// One `chat` covers both plain and tool-calling turns: when the request
/// carries a tool catalog, the response may carry tool calls alongside or
/// instead of text.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// One blocking completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion: emits deltas through `delta_tx` as they
    /// arrive and returns the fully assembled response. The sender is
    /// dropped before returning, which closes the delta channel.
    ///
    /// Default implementation calls `chat` and emits the full content as
    /// a single text delta.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        delta_tx: mpsc::Sender<ProviderDelta>,
    ) -> Result<ChatResponse, ProviderError> {
        let response = self.chat(request).await?;
        if !response.content.is_empty() {
            let _ = delta_tx
                .send(ProviderDelta::Text {
                    content: response.content.clone(),
                })
                .await;
        }
        Ok(response)
    }
}

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Dimensionality of the vectors `embed` returns.
    fn dimensions(&self) -> usize;
}

/// Wraps a provider in the standard decorator stack:
/// `telemetry(rate_limit(retry(provider)))`. `rpm` / `tpm` of 0 disable
/// that bucket.
pub fn decorate(
    provider: Arc<dyn Provider>,
    retry: RetryConfig,
    rpm: u32,
    tpm: u32,
) -> Arc<dyn Provider> {
    let retried: Arc<dyn Provider> = Arc::new(RetryProvider::new(provider, retry));
    let limited: Arc<dyn Provider> = Arc::new(RateLimitProvider::new(retried, rpm, tpm));
    Arc::new(TelemetryProvider::new(limited))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    #[tokio::test]
    async fn default_chat_stream_emits_single_text_delta() {
        let provider = MockProvider::new(vec![Ok(ChatResponse::text("hello"))]);
        let (tx, mut rx) = mpsc::channel(4);
        let req = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let resp = provider.chat_stream(&req, tx).await.unwrap();
        assert_eq!(resp.content, "hello");
        match rx.recv().await {
            Some(ProviderDelta::Text { content }) => assert_eq!(content, "hello"),
            other => panic!("expected one text delta, got {:?}", other),
        }
        assert!(rx.recv().await.is_none(), "delta channel closed");
    }
}
