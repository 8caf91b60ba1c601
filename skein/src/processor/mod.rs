//! Processor pipeline: ordered pre-LLM / post-LLM / post-tool hooks.
//!
//! Processors run in registration order; the first halt or suspend wins.
//! Halt and suspend are control signals, not errors — a halt's reason
//! becomes the run's final output, a suspension pauses the run and hands
//! the caller a resumable marker.

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentTask;
use crate::error::AgentError;
use crate::message::{ChatMessage, ChatResponse};
use crate::tool::ToolResult;

/// Control signal returned by a processor.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// Keep going.
    Continue,
    /// Short-circuit the run; the reason becomes the final output.
    Halt(String),
    /// Pause the run; the payload goes to the caller inside the
    /// suspension marker. Honored from pre-LLM processors and tools;
    /// in post hooks it degrades to a halt.
    Suspend(Value),
}

/// Read-only view of the run a processor executes under.
pub struct ProcessorContext<'a> {
    pub task: &'a AgentTask,
    /// Approval data supplied on resume; present only for the iteration
    /// that re-enters the pipeline after a suspension.
    pub resume_data: Option<&'a Value>,
}

/// Runs before every LLM call with the full message history.
#[async_trait]
pub trait PreLlmProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        ctx: &ProcessorContext<'_>,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<Signal, AgentError>;
}

/// Runs after every LLM response (streamed responses after assembly).
/// May validate or redact by mutating `output`.
#[async_trait]
pub trait PostLlmProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        ctx: &ProcessorContext<'_>,
        response: &ChatResponse,
        output: &mut String,
    ) -> Result<Signal, AgentError>;
}

/// Runs after every tool result with (tool name, args, result).
/// May redact by mutating the result; the history entry is updated.
#[async_trait]
pub trait PostToolProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        ctx: &ProcessorContext<'_>,
        tool_name: &str,
        args: &Value,
        result: &mut ToolResult,
    ) -> Result<Signal, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Redactor;

    #[async_trait]
    impl PostToolProcessor for Redactor {
        fn name(&self) -> &str {
            "redactor"
        }

        async fn process(
            &self,
            _ctx: &ProcessorContext<'_>,
            _tool_name: &str,
            _args: &Value,
            result: &mut ToolResult,
        ) -> Result<Signal, AgentError> {
            result.content = result.content.replace("secret", "[redacted]");
            Ok(Signal::Continue)
        }
    }

    #[tokio::test]
    async fn post_tool_processor_can_redact() {
        let task = AgentTask::new("input");
        let ctx = ProcessorContext {
            task: &task,
            resume_data: None,
        };
        let mut result = ToolResult::ok("the secret value");
        let signal = Redactor
            .process(&ctx, "lookup", &serde_json::json!({}), &mut result)
            .await
            .unwrap();
        assert_eq!(signal, Signal::Continue);
        assert_eq!(result.content, "the [redacted] value");
    }
}
