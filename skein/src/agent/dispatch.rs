//! Parallel tool dispatch for one LLM response.
//!
//! All calls run concurrently, bounded by a semaphore; outcomes come back
//! in the original call order regardless of completion order. A sibling's
//! failure cancels nothing — only the caller's context does.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::ToolError;
use crate::event::EventSink;
use crate::message::ToolCall;
use crate::tool::{ToolContext, ToolRegistry, ToolResult};

/// Result of one dispatched call, tagged with its originating call.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub call: ToolCall,
    pub result: ToolResult,
    /// Set when a human-in-the-loop tool asked to pause the run.
    pub suspend: Option<serde_json::Value>,
    pub duration_ms: u64,
}

/// Dispatches `calls` concurrently (at most `max_parallel` in flight) and
/// returns one outcome per call, in call order.
///
/// Infallible by design: cancellation and panics become error results so
/// every emitted `tool_call_start` can still be paired with a result.
pub async fn dispatch_parallel(
    registry: Arc<ToolRegistry>,
    ctx: &ToolContext,
    calls: Vec<ToolCall>,
    max_parallel: usize,
    sink: &EventSink,
) -> Vec<DispatchOutcome> {
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let call_snapshot = calls.clone();
    let mut handles = Vec::with_capacity(calls.len());

    for (index, call) in calls.into_iter().enumerate() {
        let registry = Arc::clone(&registry);
        let semaphore = Arc::clone(&semaphore);
        let ctx = ctx.clone();
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return (index, cancelled_outcome(call));
                }
                permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
            };

            let started = Instant::now();
            let dispatched = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
                result = registry.dispatch(&ctx, &call.name, call.args.clone(), &sink, &call.id) => result,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let outcome = match dispatched {
                Ok(result) => DispatchOutcome {
                    call,
                    result,
                    suspend: None,
                    duration_ms,
                },
                Err(ToolError::Suspended(payload)) => DispatchOutcome {
                    call,
                    result: ToolResult::error("suspended awaiting approval"),
                    suspend: Some(payload),
                    duration_ms,
                },
                Err(err) => DispatchOutcome {
                    call,
                    result: ToolResult::error(err.to_string()),
                    suspend: None,
                    duration_ms,
                },
            };
            (index, outcome)
        }));
    }

    let mut outcomes: Vec<Option<DispatchOutcome>> = Vec::new();
    outcomes.resize_with(handles.len(), || None);
    for handle in handles {
        match handle.await {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(join_err) => {
                debug!(error = %join_err, "tool dispatch task failed to join");
            }
        }
    }

    // A lost join still produces an outcome so start/result pairing holds.
    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| DispatchOutcome {
                call: call_snapshot[index].clone(),
                result: ToolResult::error("tool dispatch task aborted"),
                suspend: None,
                duration_ms: 0,
            })
        })
        .collect()
}

fn cancelled_outcome(call: ToolCall) -> DispatchOutcome {
    DispatchOutcome {
        call,
        result: ToolResult::error("tool dispatch cancelled"),
        suspend: None,
        duration_ms: 0,
    }
}
