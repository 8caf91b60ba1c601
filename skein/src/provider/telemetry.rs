//! Telemetry decorator: wraps each provider call in an `agent.llm.call`
//! span and records timing and usage.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info_span, Instrument};

use crate::error::ProviderError;
use crate::message::{ChatRequest, ChatResponse};

use super::{Provider, ProviderDelta};

pub struct TelemetryProvider {
    inner: Arc<dyn Provider>,
}

impl TelemetryProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Provider for TelemetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let span = info_span!(
            "agent.llm.call",
            provider = self.inner.name(),
            messages = request.messages.len(),
            tools = request.tools.len(),
        );
        let started = Instant::now();
        let result = self.inner.chat(request).instrument(span).await;
        match &result {
            Ok(response) => debug!(
                provider = self.inner.name(),
                duration_ms = started.elapsed().as_millis() as u64,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                tool_calls = response.tool_calls.len(),
                "llm call finished"
            ),
            Err(err) => debug!(
                provider = self.inner.name(),
                duration_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "llm call failed"
            ),
        }
        result
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        delta_tx: mpsc::Sender<ProviderDelta>,
    ) -> Result<ChatResponse, ProviderError> {
        let span = info_span!(
            "agent.llm.call",
            provider = self.inner.name(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            streaming = true,
        );
        self.inner.chat_stream(request, delta_tx).instrument(span).await
    }
}
