//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use skein::message::{ChatResponse, ToolCall};
use skein::tool::{FnTool, Tool, ToolDefinition, ToolResult};
use skein::{StreamEvent, TokenUsage};

pub fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        args,
    }
}

pub fn tool_call_response(calls: Vec<ToolCall>, usage: TokenUsage) -> ChatResponse {
    ChatResponse::text("").with_tool_calls(calls).with_usage(usage)
}

/// Drains a closed event channel into a vector.
pub async fn collect_events(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

/// `greet` tool: `{"name": X}` → `{"greeting": "hello X"}`.
pub fn greet_tool() -> Arc<dyn Tool> {
    Arc::new(FnTool::new(
        ToolDefinition::new("greet", "greets by name", json!({"type": "object"})),
        |_ctx, args| async move {
            let name = args["name"].as_str().unwrap_or("?");
            ToolResult::ok(json!({ "greeting": format!("hello {}", name) }).to_string())
        },
    ))
}

/// `echo` tool: sleeps `delay` then returns `args["n"]` as text, tracking
/// peak concurrency.
pub fn echo_tool(delay: Duration, peak: Arc<AtomicUsize>) -> Arc<dyn Tool> {
    let concurrent = Arc::new(AtomicUsize::new(0));
    Arc::new(FnTool::new(
        ToolDefinition::new("echo", "echoes n after a delay", json!({"type": "object"})),
        move |_ctx, args| {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                ToolResult::ok(args["n"].to_string())
            }
        },
    ))
}
