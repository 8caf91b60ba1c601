//! HTTP sandbox: the same bridge against a remote sandbox service.
//!
//! The runtime registers the execution's dispatch queue, POSTs the code,
//! and answers the tool-call envelopes the sandbox sends to the callback
//! endpoint while the request is in flight. Transient HTTP failures retry
//! with exponential backoff; the queue is drained on the way out so late
//! envelopes cannot block the sandbox.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::event::EventSink;
use crate::tool::{ToolContext, ToolRegistry};

use super::blocklist::find_blocked_pattern;
use super::protocol::{SandboxRequest, SandboxResponse};
use super::registry::{dispatch_worker, DispatchRegistry};
use super::{CodeExecutor, CodeOutcome, CodeRequest};

pub struct HttpSandboxExecutor {
    client: reqwest::Client,
    /// Execute endpoint of the sandbox service.
    endpoint: String,
    /// Public URL of this runtime's tool-callback endpoint.
    callback_url: String,
    registry: Arc<DispatchRegistry>,
    tools: Arc<ToolRegistry>,
    timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    /// Files above this size degrade to metadata-only entries.
    max_file_bytes: usize,
}

impl HttpSandboxExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        callback_url: impl Into<String>,
        registry: Arc<DispatchRegistry>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            callback_url: callback_url.into(),
            registry,
            tools,
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_file_bytes: 2 * 1024 * 1024,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: usize) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    async fn post_once(&self, request: &SandboxRequest) -> Result<SandboxResponse, SandboxError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .timeout(self.timeout + Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| SandboxError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SandboxError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<SandboxResponse>()
            .await
            .map_err(|e| SandboxError::Protocol(e.to_string()))
    }

    /// POST with bounded retries on transient conditions (network
    /// timeout, connect refused/reset, EOF, 5xx). Everything else
    /// short-circuits.
    async fn post_with_retry(
        &self,
        ctx: &ToolContext,
        request: &SandboxRequest,
    ) -> Result<SandboxResponse, SandboxError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            match self.post_once(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.initial_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient sandbox failure, retrying"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(SandboxError::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for HttpSandboxExecutor {
    async fn execute(
        &self,
        ctx: &ToolContext,
        request: CodeRequest,
    ) -> Result<CodeOutcome, SandboxError> {
        if let Some(pattern) = find_blocked_pattern(&request.code) {
            return Err(SandboxError::Blocked(pattern.to_string()));
        }

        let execution_id = Uuid::new_v4().to_string();
        let wire_request = SandboxRequest {
            execution_id: execution_id.clone(),
            callback_url: self.callback_url.clone(),
            code: request.code,
            runtime: request.runtime,
            session_id: request.session_id,
            timeout: request.timeout.unwrap_or(self.timeout).as_secs(),
            files: request.files,
        };

        // Register before the remote call so the first callback can never
        // race the registration.
        let queue = self.registry.register(&execution_id);
        let worker = tokio::spawn(dispatch_worker(
            queue,
            Arc::clone(&self.tools),
            ctx.clone(),
            EventSink::noop(),
        ));

        let outcome = self.post_with_retry(ctx, &wire_request).await;

        // Deregister and drain: the map entry's sender drops, the worker
        // finishes whatever is queued, then exits on channel close.
        self.registry.deregister(&execution_id);
        if let Err(e) = worker.await {
            warn!(error = %e, "sandbox dispatch worker failed to join");
        }

        let response = outcome?;
        debug!(execution_id = %execution_id, exit_code = response.exit_code, "sandbox execution finished");

        let files = response
            .files
            .into_iter()
            .map(|file| {
                if file.payload_bytes() > self.max_file_bytes {
                    debug!(file = %file.name, "output file above size limit, keeping metadata only");
                    file.metadata_only()
                } else {
                    file
                }
            })
            .collect();

        Ok(CodeOutcome {
            output: response.output,
            logs: response.logs,
            exit_code: response.exit_code,
            error: response.error,
            files,
        })
    }
}
