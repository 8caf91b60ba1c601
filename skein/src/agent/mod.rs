//! The `Agent` contract and its shared result types.
//!
//! Three built-in variants implement [`Agent`]: [`LlmAgent`] (single
//! provider + tools), [`crate::network::Network`] (router over sub-agents),
//! and [`crate::workflow::Workflow`] (DAG of steps). All of them run under
//! one uniform contract: blocking `execute` and streaming `execute_stream`.

mod dispatch;
mod llm_agent;
mod plan;
mod suspend;

pub use dispatch::{dispatch_parallel, DispatchOutcome};
pub use llm_agent::{LlmAgent, LlmAgentBuilder, SystemPrompt};
pub use plan::{plan_tool_definition, PlanStep, TOOL_EXECUTE_PLAN};
pub use suspend::Suspension;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgentError;
use crate::event::EventSink;
use stream_event::TokenUsage;

/// One unit of work handed to an agent. Immutable once created.
#[derive(Clone, Debug, Default)]
pub struct AgentTask {
    pub input: String,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    /// Opaque caller-supplied values, visible to processors and tools.
    pub context: HashMap<String, Value>,
}

impl AgentTask {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Cancellation handle plus run identity, propagated into every provider
/// call, tool dispatch, and spawned worker.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: String,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            cancel,
        }
    }

    /// Child context sharing the run id; cancelling the child does not
    /// cancel the parent, cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a run stopped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The provider returned a final text response.
    Completed,
    /// A processor halted; its reason is the final output.
    Halted { by: String },
    /// The iteration cap was reached; the last response is the output.
    MaxIterations,
    /// The caller's context was cancelled.
    Cancelled,
    /// A processor or tool suspended; see `AgentResult::suspension`.
    Suspended,
}

/// Per-operation record accumulated during a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepTrace {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub usage: TokenUsage,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepTrace {
    pub fn ok(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        input: Value,
        output: Value,
    ) -> Self {
        Self {
            name: name.into(),
            started_at,
            duration_ms,
            usage: TokenUsage::default(),
            input,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(
        name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        input: Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            started_at,
            duration_ms,
            usage: TokenUsage::default(),
            input,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Final result of one run. Immutable once returned.
#[derive(Debug, Default)]
pub struct AgentResult {
    pub output: String,
    /// Sum of every inner operation's usage for this turn.
    pub usage: TokenUsage,
    pub steps: Vec<StepTrace>,
    pub stop: StopReason,
    /// Present when the run paused for external input; resume through it.
    pub suspension: Option<Suspension>,
}

impl Default for StopReason {
    fn default() -> Self {
        StopReason::Completed
    }
}

impl AgentResult {
    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    /// JSON view for transports (SSE `done` records). The continuation is
    /// not serializable; a suspended result carries the payload only.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "output": self.output,
            "usage": self.usage,
            "stop": self.stop,
            "steps": self.steps,
            "suspension": self.suspension.as_ref().map(|s| s.payload.clone()),
        })
    }
}

/// The uniform agent contract.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Blocking execution.
    async fn execute(&self, ctx: &RunContext, task: AgentTask) -> Result<AgentResult, AgentError>;

    /// Streaming execution: events flow through `sink` while the run
    /// progresses; the result is returned as in `execute`. The runtime
    /// drops the sink (closing the channel) before returning.
    ///
    /// The default forwards to `execute` and emits nothing.
    async fn execute_stream(
        &self,
        ctx: &RunContext,
        task: AgentTask,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        drop(sink);
        self.execute(ctx, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_builder_sets_keys() {
        let task = AgentTask::new("hello")
            .with_thread("t1")
            .with_user("u1")
            .with_context_value("k", serde_json::json!(1));
        assert_eq!(task.input, "hello");
        assert_eq!(task.thread_id.as_deref(), Some("t1"));
        assert_eq!(task.user_id.as_deref(), Some("u1"));
        assert_eq!(task.context["k"], serde_json::json!(1));
    }

    #[test]
    fn child_context_inherits_cancellation() {
        let ctx = RunContext::new();
        let child = ctx.child();
        assert_eq!(ctx.run_id, child.run_id);
        ctx.cancel.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn result_json_carries_stop_reason() {
        let result = AgentResult {
            output: "done".into(),
            stop: StopReason::MaxIterations,
            ..Default::default()
        };
        let v = result.to_value();
        assert_eq!(v["output"], "done");
        assert_eq!(v["stop"]["reason"], "max_iterations");
        assert!(v["suspension"].is_null());
    }
}
