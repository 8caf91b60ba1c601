//! Suspend / resume: processor suspensions, HITL tool suspensions, and
//! the streaming resume variant.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{call, collect_events, kinds, tool_call_response};
use skein::message::{ChatMessage, ChatResponse, Role};
use skein::processor::{PreLlmProcessor, ProcessorContext, Signal};
use skein::tool::{Tool, ToolContext, ToolDefinition, ToolResult};
use skein::{
    AgentError, AgentTask, EventSink, LlmAgent, MockProvider, RunContext, StopReason, TokenUsage,
    ToolError,
};
use skein::Agent;

/// Suspends until resume data shows up, then lets the run continue.
struct ApprovalGate;

#[async_trait]
impl PreLlmProcessor for ApprovalGate {
    fn name(&self) -> &str {
        "approval_gate"
    }

    async fn process(
        &self,
        ctx: &ProcessorContext<'_>,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<Signal, AgentError> {
        match ctx.resume_data {
            None => Ok(Signal::Suspend(json!({"ask": "approve?"}))),
            Some(data) => {
                messages.push(ChatMessage::system(format!("approved: {}", data)));
                Ok(Signal::Continue)
            }
        }
    }
}

#[tokio::test]
async fn processor_suspension_resumes_to_a_normal_result() {
    let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("done")
        .with_usage(TokenUsage::new(2, 2)))]));
    let agent = LlmAgent::builder("gated", provider.clone())
        .pre_processor(Arc::new(ApprovalGate))
        .build();

    let first = agent
        .execute(&RunContext::new(), AgentTask::new("do the thing"))
        .await
        .unwrap();
    assert_eq!(first.stop, StopReason::Suspended);
    assert_eq!(provider.call_count(), 0, "suspended before the provider");
    let suspension = first.suspension.as_ref().expect("suspension marker");
    assert_eq!(suspension.payload["ask"], "approve?");

    let resumed = suspension.resume(json!("yes")).await.unwrap();
    assert_eq!(resumed.output, "done");
    assert_eq!(resumed.stop, StopReason::Completed);

    // The approval reached the resumed pipeline.
    let request = &provider.requests()[0];
    assert!(request
        .messages
        .iter()
        .any(|m| m.content.contains("approved") && m.content.contains("yes")));

    // A continuation is consumed exactly once.
    assert!(matches!(
        suspension.resume(json!("again")).await,
        Err(AgentError::SuspensionConsumed)
    ));
}

#[tokio::test]
async fn streaming_suspension_closes_and_reopens_channels() {
    let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("done"))]));
    let agent = LlmAgent::builder("gated", provider)
        .pre_processor(Arc::new(ApprovalGate))
        .build();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(64, ctx.cancel.clone());
    let first = agent
        .execute_stream(&ctx, AgentTask::new("go"), sink)
        .await
        .unwrap();
    assert_eq!(first.stop, StopReason::Suspended);

    // First channel closed once the suspended result came back.
    let first_events = collect_events(rx).await;
    assert!(kinds(&first_events).contains(&"input_received"));

    // Resume on a fresh channel delivers the rest of the run's events.
    let suspension = first.suspension.as_ref().unwrap();
    let cancel = CancellationToken::new();
    let (resume_sink, resume_rx) = EventSink::channel(64, cancel.clone());
    let resumed = suspension
        .resume_stream(json!("yes"), resume_sink)
        .await
        .unwrap();
    assert_eq!(resumed.output, "done");

    let resume_events = collect_events(resume_rx).await;
    let resume_kinds = kinds(&resume_events);
    assert!(resume_kinds.contains(&"processing_start"));
    assert!(resume_kinds.contains(&"text_delta"));
}

/// Human-in-the-loop tool: always suspends for confirmation.
struct ConfirmTool;

#[async_trait]
impl Tool for ConfirmTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "confirm_delete",
            "asks a human before deleting",
            json!({"type": "object"}),
        )]
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        _name: &str,
        args: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        Err(ToolError::Suspended(json!({
            "confirm": "delete",
            "target": args["target"],
        })))
    }
}

#[tokio::test]
async fn hitl_tool_suspension_resumes_with_the_approval_as_result() {
    let provider = Arc::new(MockProvider::new(vec![
        Ok(tool_call_response(
            vec![call("c1", "confirm_delete", json!({"target": "db"}))],
            TokenUsage::new(1, 1),
        )),
        Ok(ChatResponse::text("deleted")),
    ]));
    let agent = LlmAgent::builder("careful", provider.clone())
        .tool(Arc::new(ConfirmTool))
        .build();

    let first = agent
        .execute(&RunContext::new(), AgentTask::new("delete the db"))
        .await
        .unwrap();
    assert_eq!(first.stop, StopReason::Suspended);
    let suspension = first.suspension.as_ref().unwrap();
    assert_eq!(suspension.payload["confirm"], "delete");

    let resumed = suspension.resume(json!("approved")).await.unwrap();
    assert_eq!(resumed.output, "deleted");

    // The approval text became the suspended call's tool result.
    let second = &provider.requests()[1];
    let tool_message = second
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tool_message.content, "approved");
}
