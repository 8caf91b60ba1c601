//! Workflow execution: ready-set scheduling over the validated DAG.
//!
//! A step never starts before every declared dependency has finished
//! (and emitted `step_finish`). Ready steps spawn in descending
//! longest-path rank under the workflow concurrency cap. Failure policy
//! is applied per step as results come back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};

use crate::agent::{AgentResult, AgentTask, RunContext, StepTrace, StopReason};
use crate::error::AgentError;
use crate::event::EventSink;
use stream_event::{StreamEvent, TokenUsage};

use super::{
    resolve_ref, ErrorPolicy, ItemsSource, Step, StepBody, StepInput, StepKind, Workflow,
};

/// What one finished step task reports back to the scheduler.
struct StepDone {
    name: String,
    result: Result<Value, String>,
    usage: TokenUsage,
    inner_steps: Vec<StepTrace>,
    started_at: chrono::DateTime<chrono::Utc>,
    duration_ms: u64,
    policy: ErrorPolicy,
}

pub(super) async fn run(
    workflow: &Workflow,
    ctx: &RunContext,
    task: AgentTask,
    sink: EventSink,
) -> Result<AgentResult, AgentError> {
    let span = info_span!("workflow.execute", workflow = %workflow.name, run_id = %ctx.run_id);
    run_inner(workflow, ctx, task, sink).instrument(span).await
}

async fn run_inner(
    workflow: &Workflow,
    ctx: &RunContext,
    task: AgentTask,
    sink: EventSink,
) -> Result<AgentResult, AgentError> {
    sink.emit(StreamEvent::InputReceived {
        input: task.input.clone(),
    })
    .await;

    // Fail-fast cancels this token; the caller's cancellation reaches it
    // as the parent.
    let wf_cancel = ctx.cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(workflow.concurrency));
    let task = Arc::new(task);

    let mut pending: Vec<Arc<Step>> = workflow.steps.clone();
    let mut outputs: HashMap<String, Value> = HashMap::new();
    let mut finished: HashSet<String> = HashSet::new();
    let mut traces: Vec<StepTrace> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut failing_fast = false;
    let mut running: JoinSet<StepDone> = JoinSet::new();

    loop {
        let mut skipped_this_round = false;
        if !failing_fast && !wf_cancel.is_cancelled() {
            // Ready: every dependency (after + wiring refs) finished.
            let (ready, blocked): (Vec<Arc<Step>>, Vec<Arc<Step>>) =
                pending.into_iter().partition(|step| {
                    step.after.iter().all(|d| finished.contains(d))
                        && step
                            .input_refs()
                            .iter()
                            .all(|r| finished.contains(*r))
                });
            pending = blocked;

            let mut ready = ready;
            ready.sort_by_key(|s| std::cmp::Reverse(workflow.ranks.get(&s.name).copied().unwrap_or(0)));

            for step in ready {
                // A consumer of a failed or skipped step is skipped.
                let missing_input = step
                    .input_refs()
                    .iter()
                    .find(|r| !outputs.contains_key(**r))
                    .map(|r| r.to_string());
                if let Some(upstream) = missing_input {
                    debug!(step = %step.name, %upstream, "skipping step, upstream produced no output");
                    traces.push(StepTrace::failed(
                        step.name.clone(),
                        Utc::now(),
                        0,
                        Value::Null,
                        format!("skipped: upstream step '{}' failed", upstream),
                    ));
                    finished.insert(step.name.clone());
                    skipped_this_round = true;
                    continue;
                }

                let input = match &step.input_from {
                    Some(reference) => resolve_ref(reference, &outputs).unwrap_or(Value::Null),
                    None => Value::String(task.input.clone()),
                };
                let step_input = StepInput {
                    input,
                    outputs: outputs.clone(),
                };

                let step = Arc::clone(&step);
                let sink = sink.clone();
                let ctx = RunContext {
                    run_id: ctx.run_id.clone(),
                    cancel: wf_cancel.child_token(),
                };
                let task = Arc::clone(&task);
                let semaphore = Arc::clone(&semaphore);
                let concurrency = workflow.concurrency;
                running.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    run_step(step, step_input, ctx, task, sink, concurrency).await
                });
            }
        }

        if running.is_empty() {
            if pending.is_empty() || failing_fast || wf_cancel.is_cancelled() {
                break;
            }
            if skipped_this_round {
                // A skip may have unblocked dependents; re-partition.
                continue;
            }
            // Validated DAG: unreachable unless a task was lost.
            warn!(remaining = pending.len(), "workflow stalled with pending steps");
            for step in &pending {
                traces.push(StepTrace::failed(
                    step.name.clone(),
                    Utc::now(),
                    0,
                    Value::Null,
                    "skipped: scheduler stalled",
                ));
            }
            break;
        }

        match running.join_next().await {
            Some(Ok(done)) => {
                usage.add(done.usage);
                finished.insert(done.name.clone());
                match done.result {
                    Ok(output) => {
                        traces.push(
                            StepTrace::ok(
                                done.name.clone(),
                                done.started_at,
                                done.duration_ms,
                                Value::Null,
                                output.clone(),
                            )
                            .with_usage(done.usage),
                        );
                        traces.extend(done.inner_steps);
                        outputs.insert(done.name, output);
                    }
                    Err(error) => {
                        traces.push(StepTrace::failed(
                            done.name.clone(),
                            done.started_at,
                            done.duration_ms,
                            Value::Null,
                            error.clone(),
                        ));
                        traces.extend(done.inner_steps);
                        if done.policy != ErrorPolicy::Continue {
                            debug!(step = %done.name, "fail-fast: cancelling remaining steps");
                            failing_fast = true;
                            wf_cancel.cancel();
                            for step in pending.drain(..) {
                                traces.push(StepTrace::failed(
                                    step.name.clone(),
                                    Utc::now(),
                                    0,
                                    Value::Null,
                                    format!("skipped: cancelled after '{}' failed", done.name),
                                ));
                            }
                        }
                    }
                }
            }
            Some(Err(join_err)) => {
                warn!(error = %join_err, "workflow step task failed to join");
            }
            None => {}
        }
    }

    let stop = if ctx.is_cancelled() {
        StopReason::Cancelled
    } else {
        StopReason::Completed
    };
    let output = serde_json::to_string(&outputs).unwrap_or_else(|_| "{}".to_string());
    Ok(AgentResult {
        output,
        usage,
        steps: traces,
        stop,
        suspension: None,
    })
}

/// Runs one step with its retry policy, emitting `step_start` /
/// `step_finish` (and `step_progress` for fan-outs).
async fn run_step(
    step: Arc<Step>,
    input: StepInput,
    ctx: RunContext,
    task: Arc<AgentTask>,
    sink: EventSink,
    concurrency: usize,
) -> StepDone {
    let span = info_span!("workflow.step", step = %step.name);
    async move {
        sink.emit(StreamEvent::StepStart {
            name: step.name.clone(),
        })
        .await;

        let started_at = Utc::now();
        let clock = Instant::now();

        let (attempts, backoff) = match &step.on_error {
            ErrorPolicy::Retry { attempts, backoff } => (attempts + 1, *backoff),
            _ => (1, std::time::Duration::ZERO),
        };

        let mut usage = TokenUsage::default();
        let mut inner_steps = Vec::new();
        let mut result: Result<Value, String> = Err("step never ran".into());
        for attempt in 1..=attempts {
            result = run_body(
                &step,
                input.clone(),
                &ctx,
                &task,
                &sink,
                concurrency,
                &mut usage,
                &mut inner_steps,
            )
            .await;
            match &result {
                Ok(_) => break,
                Err(error) if attempt < attempts && !ctx.is_cancelled() => {
                    let delay = backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(step = %step.name, attempt, error = %error, "step failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(_) => break,
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        sink.emit(StreamEvent::StepFinish {
            name: step.name.clone(),
            output: result.as_ref().cloned().unwrap_or(Value::Null),
            error: result.as_ref().err().cloned(),
            duration_ms,
        })
        .await;

        StepDone {
            name: step.name.clone(),
            result,
            usage,
            inner_steps,
            started_at,
            duration_ms,
            policy: step.on_error.clone(),
        }
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_body(
    step: &Step,
    input: StepInput,
    ctx: &RunContext,
    task: &AgentTask,
    sink: &EventSink,
    concurrency: usize,
    usage: &mut TokenUsage,
    inner_steps: &mut Vec<StepTrace>,
) -> Result<Value, String> {
    if ctx.is_cancelled() {
        return Err("cancelled".into());
    }
    match &step.kind {
        StepKind::Func(f) => f(input).await.map_err(|e| e.to_string()),
        StepKind::Agent(agent) => {
            run_agent_body(agent.as_ref(), input.input, ctx, task, sink, usage, inner_steps).await
        }
        StepKind::ForEach { items, body } => {
            let items = match items {
                ItemsSource::Literal(items) => items.clone(),
                ItemsSource::From(reference) => match resolve_ref(reference, &input.outputs) {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => return Err(format!("for_each source '{}' missing", reference)),
                },
            };
            let total = items.len();

            let mut in_flight = FuturesUnordered::new();
            let mut iter = items.into_iter().enumerate();
            let mut results: Vec<Option<Result<Value, String>>> = Vec::new();
            results.resize_with(total, || None);
            let mut completed = 0usize;

            // Fan out bounded by the workflow cap; progress is emitted from
            // this driving loop so `completed` is strictly monotonic.
            loop {
                while in_flight.len() < concurrency.max(1) {
                    let Some((index, item)) = iter.next() else { break };
                    let outputs = input.outputs.clone();
                    in_flight.push(run_item(
                        body, index, item, outputs, ctx, task, sink,
                    ));
                }
                let Some((index, item_result, item_usage, item_steps)) = in_flight.next().await
                else {
                    break;
                };
                usage.add(item_usage);
                inner_steps.extend(item_steps);
                completed += 1;
                sink.emit(StreamEvent::StepProgress {
                    name: step.name.clone(),
                    completed,
                    total,
                })
                .await;
                results[index] = Some(item_result);
            }

            let mut collected = Vec::with_capacity(total);
            for (index, slot) in results.into_iter().enumerate() {
                match slot {
                    Some(Ok(value)) => collected.push(value),
                    Some(Err(error)) => {
                        return Err(format!("item {} failed: {}", index, error))
                    }
                    None => return Err(format!("item {} never completed", index)),
                }
            }
            Ok(Value::Array(collected))
        }
    }
}

async fn run_item(
    body: &StepBody,
    index: usize,
    item: Value,
    outputs: HashMap<String, Value>,
    ctx: &RunContext,
    task: &AgentTask,
    sink: &EventSink,
) -> (usize, Result<Value, String>, TokenUsage, Vec<StepTrace>) {
    let mut usage = TokenUsage::default();
    let mut inner_steps = Vec::new();
    let result = match body {
        StepBody::Func(f) => f(StepInput {
            input: item,
            outputs,
        })
        .await
        .map_err(|e| e.to_string()),
        StepBody::Agent(agent) => {
            run_agent_body(agent.as_ref(), item, ctx, task, sink, &mut usage, &mut inner_steps)
                .await
        }
    };
    (index, result, usage, inner_steps)
}

/// Runs a nested agent; its events forward verbatim on the shared sink.
async fn run_agent_body(
    agent: &dyn crate::agent::Agent,
    input: Value,
    ctx: &RunContext,
    task: &AgentTask,
    sink: &EventSink,
    usage: &mut TokenUsage,
    inner_steps: &mut Vec<StepTrace>,
) -> Result<Value, String> {
    let input_text = match input {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let sub_task = AgentTask {
        input: input_text,
        thread_id: task.thread_id.clone(),
        user_id: task.user_id.clone(),
        context: task.context.clone(),
    };
    let child = ctx.child();
    match agent.execute_stream(&child, sub_task, sink.clone()).await {
        Ok(result) => {
            usage.add(result.usage);
            inner_steps.extend(result.steps);
            if result.stop == StopReason::Cancelled {
                Err("cancelled".into())
            } else {
                Ok(json!(result.output))
            }
        }
        Err(err) => Err(err.to_string()),
    }
}
