//! End-to-end loop behavior: happy path, event pairing, usage
//! conservation, halts, iteration caps, and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::{call, collect_events, greet_tool, kinds, tool_call_response};
use skein::message::{ChatMessage, ChatResponse, Role};
use skein::processor::{PreLlmProcessor, ProcessorContext, Signal};
use skein::tool::{FnTool, ToolDefinition, ToolResult};
use skein::{
    AgentError, AgentTask, EventSink, LlmAgent, MockProvider, RunContext, StopReason, StreamEvent,
    TokenUsage,
};
use skein::Agent;

#[tokio::test]
async fn tool_happy_path_returns_final_text() {
    let provider = Arc::new(MockProvider::new(vec![
        Ok(tool_call_response(
            vec![call("c1", "greet", json!({"name": "world"}))],
            TokenUsage::new(10, 5),
        )),
        Ok(ChatResponse::text("hello world").with_usage(TokenUsage::new(7, 3))),
    ]));
    let agent = LlmAgent::builder("greeter", provider.clone())
        .tool(greet_tool())
        .build();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(64, ctx.cancel.clone());
    let result = agent
        .execute_stream(&ctx, AgentTask::new("greet the world"), sink)
        .await
        .unwrap();

    assert_eq!(result.output, "hello world");
    assert_eq!(result.stop, StopReason::Completed);
    // Usage conservation: result usage equals the sum of provider calls.
    assert_eq!(result.usage, TokenUsage::new(17, 8));

    let events = collect_events(rx).await;
    let starts: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| e.kind() == "tool_call_start")
        .collect();
    let results: Vec<&StreamEvent> = events
        .iter()
        .filter(|e| e.kind() == "tool_call_result")
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(results.len(), 1);
    match (starts[0], results[0]) {
        (
            StreamEvent::ToolCallStart { id: start_id, .. },
            StreamEvent::ToolCallResult { id: result_id, error, content, .. },
        ) => {
            assert_eq!(start_id, "c1");
            assert_eq!(result_id, "c1");
            assert!(error.is_none());
            assert!(content.contains("hello world"));
        }
        other => panic!("unexpected events: {:?}", other),
    }

    // The second provider request carries the tool reply, correlated by id.
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    let tool_messages: Vec<&ChatMessage> = requests[1]
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn tool_error_is_data_and_the_loop_continues() {
    let failing = Arc::new(FnTool::new(
        ToolDefinition::new("lookup", "always fails", json!({"type": "object"})),
        |_ctx, _args| async move { ToolResult::error("record not found") },
    ));
    let provider = Arc::new(MockProvider::new(vec![
        Ok(tool_call_response(
            vec![call("c1", "lookup", json!({"key": "x"}))],
            TokenUsage::new(4, 2),
        )),
        Ok(ChatResponse::text("could not find it")),
    ]));
    let agent = LlmAgent::builder("finder", provider.clone())
        .tool(failing)
        .build();

    let result = agent
        .execute(&RunContext::new(), AgentTask::new("find x"))
        .await
        .unwrap();
    assert_eq!(result.output, "could not find it");

    // The model saw the failure as message content.
    let second = &provider.requests()[1];
    let tool_message = second
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_message.content.contains("record not found"));
}

struct PolicyHalt;

#[async_trait]
impl PreLlmProcessor for PolicyHalt {
    fn name(&self) -> &str {
        "policy_halt"
    }

    async fn process(
        &self,
        _ctx: &ProcessorContext<'_>,
        _messages: &mut Vec<ChatMessage>,
    ) -> Result<Signal, AgentError> {
        Ok(Signal::Halt("blocked by policy".into()))
    }
}

#[tokio::test]
async fn processor_halt_short_circuits_before_the_provider() {
    let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("unused"))]));
    let agent = LlmAgent::builder("guarded", provider.clone())
        .pre_processor(Arc::new(PolicyHalt))
        .build();

    let result = agent
        .execute(&RunContext::new(), AgentTask::new("anything"))
        .await
        .unwrap();
    assert_eq!(result.output, "blocked by policy");
    assert_eq!(
        result.stop,
        StopReason::Halted {
            by: "policy_halt".into()
        }
    );
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn iteration_cap_returns_last_response() {
    // The model keeps asking for tools forever.
    let script: Vec<Result<ChatResponse, skein::ProviderError>> = (0..5)
        .map(|i| {
            Ok(tool_call_response(
                vec![call(&format!("c{}", i), "greet", json!({"name": "x"}))],
                TokenUsage::new(1, 1),
            ))
        })
        .collect();
    let provider = Arc::new(MockProvider::new(script));
    let agent = LlmAgent::builder("looper", provider.clone())
        .tool(greet_tool())
        .max_iterations(2)
        .build();

    let result = agent
        .execute(&RunContext::new(), AgentTask::new("go"))
        .await
        .unwrap();
    assert_eq!(result.stop, StopReason::MaxIterations);
    assert_eq!(provider.call_count(), 2);
    assert_eq!(result.usage, TokenUsage::new(2, 2));
}

#[tokio::test]
async fn cancellation_during_dispatch_returns_promptly() {
    let slow = Arc::new(FnTool::new(
        ToolDefinition::new("slow", "sleeps for a long time", json!({"type": "object"})),
        |ctx, _args| async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => ToolResult::error("cancelled"),
                _ = tokio::time::sleep(Duration::from_secs(30)) => ToolResult::ok("done"),
            }
        },
    ));
    let provider = Arc::new(MockProvider::new(vec![Ok(tool_call_response(
        vec![call("c1", "slow", json!({}))],
        TokenUsage::default(),
    ))]));
    let agent = LlmAgent::builder("cancellable", provider)
        .tool(slow)
        .build();

    let ctx = RunContext::new();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        agent.execute(&ctx, AgentTask::new("go")),
    )
    .await
    .expect("execute must return promptly after cancellation")
    .unwrap();
    assert_eq!(result.stop, StopReason::Cancelled);
}

struct CountingTool;

#[async_trait]
impl skein::Tool for CountingTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "count",
            "counts with progress",
            json!({"type": "object"}),
        )]
    }

    async fn execute(
        &self,
        _ctx: &skein::ToolContext,
        _name: &str,
        _args: serde_json::Value,
    ) -> Result<ToolResult, skein::ToolError> {
        Ok(ToolResult::ok("3"))
    }

    async fn execute_stream(
        &self,
        ctx: &skein::ToolContext,
        name: &str,
        args: serde_json::Value,
        sink: &EventSink,
        call_id: &str,
    ) -> Result<ToolResult, skein::ToolError> {
        for i in 1..=3 {
            sink.emit(StreamEvent::ToolProgress {
                id: call_id.to_string(),
                name: "count".into(),
                data: json!({ "at": i }),
            })
            .await;
        }
        self.execute(ctx, name, args).await
    }
}

#[tokio::test]
async fn streaming_tools_emit_progress_between_start_and_result() {
    let provider = Arc::new(MockProvider::new(vec![
        Ok(tool_call_response(
            vec![call("c1", "count", json!({}))],
            TokenUsage::default(),
        )),
        Ok(ChatResponse::text("counted")),
    ]));
    let agent = LlmAgent::builder("counter", provider)
        .tool(Arc::new(CountingTool))
        .build();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(64, ctx.cancel.clone());
    agent
        .execute_stream(&ctx, AgentTask::new("count"), sink)
        .await
        .unwrap();

    let events = collect_events(rx).await;
    let observed = kinds(&events);
    let start = observed.iter().position(|k| *k == "tool_call_start").unwrap();
    let first_progress = observed.iter().position(|k| *k == "tool_progress").unwrap();
    let result = observed.iter().position(|k| *k == "tool_call_result").unwrap();
    assert_eq!(
        observed.iter().filter(|k| **k == "tool_progress").count(),
        3
    );
    assert!(start < first_progress && first_progress < result);
}

#[tokio::test]
async fn streamed_run_closes_the_channel_exactly_once() {
    let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("hi"))]));
    let agent = LlmAgent::builder("simple", provider).build();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(64, ctx.cancel.clone());
    agent
        .execute_stream(&ctx, AgentTask::new("hello"), sink)
        .await
        .unwrap();

    let events = collect_events(rx).await; // recv() returned None: closed
    let observed = kinds(&events);
    assert!(observed.contains(&"input_received"));
    assert!(observed.contains(&"processing_start"));
    assert!(observed.contains(&"text_delta"));
}
