//! Execution-id → dispatch-queue map for the HTTP bridge.
//!
//! An execution registers its queue before the remote call goes out and
//! deregisters after it returns. Callback envelopes route to the queue
//! and wait for the reply; envelopes arriving for an unknown or finished
//! execution get an error reply instead of blocking the sandbox.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::event::EventSink;
use crate::tool::{ToolContext, ToolRegistry};

use super::protocol::{ToolCallbackRequest, ToolCallbackResponse};
use super::TOOL_EXECUTE_CODE;

/// Queue capacity per execution. Bounded so a misbehaving sandbox cannot
/// queue unbounded work.
const DISPATCH_QUEUE_CAPACITY: usize = 32;

/// One queued tool call awaiting dispatch.
pub struct PendingToolCall {
    pub name: String,
    pub args: Value,
    pub reply: oneshot::Sender<ToolCallbackResponse>,
}

/// Shared map of live executions.
#[derive(Default)]
pub struct DispatchRegistry {
    entries: DashMap<String, mpsc::Sender<PendingToolCall>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an execution and returns the receiving end of its queue.
    pub fn register(&self, execution_id: &str) -> mpsc::Receiver<PendingToolCall> {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        if self.entries.insert(execution_id.to_string(), tx).is_some() {
            warn!(execution_id, "execution id re-registered");
        }
        rx
    }

    /// Removes the execution; its queue drains and closes. Late envelopes
    /// then fail fast with an error reply.
    pub fn deregister(&self, execution_id: &str) {
        self.entries.remove(execution_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Routes one callback envelope to its execution's queue and waits
    /// for the reply.
    pub async fn dispatch(&self, request: ToolCallbackRequest) -> ToolCallbackResponse {
        // Clone the sender out of the map: the lock is held only for the
        // lookup, never across an await.
        let sender = match self.entries.get(&request.execution_id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(execution_id = %request.execution_id, "callback for unknown execution");
                return ToolCallbackResponse::error(format!(
                    "unknown or finished execution: {}",
                    request.execution_id
                ));
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingToolCall {
            name: request.name,
            args: request.args,
            reply: reply_tx,
        };
        if sender.send(pending).await.is_err() {
            return ToolCallbackResponse::error("execution already completed");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ToolCallbackResponse::error("dispatch worker dropped the call"))
    }
}

/// Drains one execution's queue, dispatching calls through the host tool
/// registry. Runs until the queue closes (deregistration after the remote
/// call returns). `execute_code` is refused here: sandbox code cannot
/// recurse into the sandbox.
pub async fn dispatch_worker(
    mut queue: mpsc::Receiver<PendingToolCall>,
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    sink: EventSink,
) {
    let sandbox_ctx = ctx.for_sandbox();
    while let Some(call) = queue.recv().await {
        let response = if call.name == TOOL_EXECUTE_CODE {
            ToolCallbackResponse::error(
                "execute_code cannot be invoked from inside the sandbox",
            )
        } else {
            match tools
                .dispatch(&sandbox_ctx, &call.name, call.args, &sink, "sandbox")
                .await
            {
                Ok(result) => match result.error {
                    None => ToolCallbackResponse::ok(Value::String(result.content)),
                    Some(error) => ToolCallbackResponse::error(error),
                },
                Err(err) => ToolCallbackResponse::error(err.to_string()),
            }
        };
        let _ = call.reply.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{FnTool, ToolDefinition, ToolResult};
    use serde_json::json;

    fn greet_tools() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FnTool::new(
            ToolDefinition::new("greet", "greets", json!({"type": "object"})),
            |_ctx, args| async move {
                ToolResult::ok(format!("hi {}", args["name"].as_str().unwrap_or("?")))
            },
        )));
        Arc::new(reg)
    }

    #[tokio::test]
    async fn envelope_routes_to_worker_and_back() {
        let registry = DispatchRegistry::new();
        let queue = registry.register("e1");
        let worker = tokio::spawn(dispatch_worker(
            queue,
            greet_tools(),
            ToolContext::default(),
            EventSink::noop(),
        ));

        let response = registry
            .dispatch(ToolCallbackRequest {
                execution_id: "e1".into(),
                name: "greet".into(),
                args: json!({"name": "x"}),
            })
            .await;
        assert_eq!(response.data, Some(Value::String("hi x".into())));

        registry.deregister("e1");
        worker.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_execution_gets_error_reply() {
        let registry = DispatchRegistry::new();
        let response = registry
            .dispatch(ToolCallbackRequest {
                execution_id: "ghost".into(),
                name: "greet".into(),
                args: json!({}),
            })
            .await;
        assert!(response.error.unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn execute_code_is_refused_inside_the_sandbox() {
        let registry = DispatchRegistry::new();
        let queue = registry.register("e1");
        let worker = tokio::spawn(dispatch_worker(
            queue,
            greet_tools(),
            ToolContext::default(),
            EventSink::noop(),
        ));

        let response = registry
            .dispatch(ToolCallbackRequest {
                execution_id: "e1".into(),
                name: TOOL_EXECUTE_CODE.into(),
                args: json!({"code": "1"}),
            })
            .await;
        assert!(response.error.unwrap().contains("inside the sandbox"));

        registry.deregister("e1");
        worker.await.unwrap();
    }
}
