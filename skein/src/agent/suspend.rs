//! Suspension: the control value a paused run hands back to its caller.
//!
//! The marker carries (a) the payload the caller must inspect and (b) a
//! continuation that owns the frozen loop state (messages, traces, usage,
//! iteration) by move. The continuation is consumed exactly once; resuming
//! re-enters the loop at the exact point the run paused.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::AgentError;
use crate::event::EventSink;

use super::AgentResult;

type ContinuationFuture = Pin<Box<dyn Future<Output = Result<AgentResult, AgentError>> + Send>>;
type Continuation = Box<dyn FnOnce(Value, EventSink) -> ContinuationFuture + Send>;

/// A paused run. Inspect `payload`, then call [`resume`](Self::resume)
/// (or [`resume_stream`](Self::resume_stream)) with approval data.
pub struct Suspension {
    /// What the suspending processor or tool wants the caller to see.
    pub payload: Value,
    continuation: Mutex<Option<Continuation>>,
}

impl Suspension {
    pub fn new(
        payload: Value,
        continuation: impl FnOnce(Value, EventSink) -> ContinuationFuture + Send + 'static,
    ) -> Self {
        Self {
            payload,
            continuation: Mutex::new(Some(Box::new(continuation))),
        }
    }

    fn take(&self) -> Result<Continuation, AgentError> {
        self.continuation
            .lock()
            .map_err(|_| AgentError::SuspensionConsumed)?
            .take()
            .ok_or(AgentError::SuspensionConsumed)
    }

    /// Resumes the run with approval data. The continuation runs to the
    /// next terminal state: a fresh result, or another suspension.
    pub async fn resume(&self, data: Value) -> Result<AgentResult, AgentError> {
        let continuation = self.take()?;
        continuation(data, EventSink::noop()).await
    }

    /// Streaming resume: events from the resumed portion of the run are
    /// delivered on the fresh channel behind `sink`.
    pub async fn resume_stream(
        &self,
        data: Value,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        let continuation = self.take()?;
        continuation(data, sink).await
    }
}

impl std::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumed = self
            .continuation
            .lock()
            .map(|c| c.is_none())
            .unwrap_or(true);
        f.debug_struct("Suspension")
            .field("payload", &self.payload)
            .field("consumed", &consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StopReason;

    fn approval_suspension() -> Suspension {
        Suspension::new(serde_json::json!({"ask": "approve?"}), |data, _sink| {
            Box::pin(async move {
                Ok(AgentResult {
                    output: format!("resumed with {}", data),
                    stop: StopReason::Completed,
                    ..Default::default()
                })
            })
        })
    }

    #[tokio::test]
    async fn resume_runs_continuation_once() {
        let suspension = approval_suspension();
        assert_eq!(suspension.payload["ask"], "approve?");

        let result = suspension.resume(serde_json::json!("yes")).await.unwrap();
        assert!(result.output.contains("yes"));

        let again = suspension.resume(serde_json::json!("no")).await;
        assert!(matches!(again, Err(AgentError::SuspensionConsumed)));
    }
}
