//! Workflow DAG execution: dependency ordering, input wiring, for-each
//! progress, and failure policies.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::collect_events;
use skein::workflow::{ErrorPolicy, ItemsSource, Step, StepBody, Workflow};
use skein::{AgentError, AgentTask, EventSink, RunContext, StopReason, StreamEvent};
use skein::Agent;

fn value_step(name: &str, value: Value) -> Step {
    let value = value.clone();
    Step::func(name, move |_input| {
        let value = value.clone();
        async move { Ok(value) }
    })
}

#[tokio::test]
async fn no_step_starts_before_its_dependencies_finish() {
    // Diamond: a → (b, c) → d.
    let workflow = Workflow::builder("diamond")
        .step(value_step("a", json!("A")))
        .step(
            Step::func("b", |_input| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!("B"))
            })
            .after("a"),
        )
        .step(value_step("c", json!("C")).after("a"))
        .step(value_step("d", json!("D")).after("b").after("c"))
        .build()
        .unwrap();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(128, ctx.cancel.clone());
    let result = workflow
        .execute_stream(&ctx, AgentTask::new("run"), sink)
        .await
        .unwrap();
    assert_eq!(result.stop, StopReason::Completed);

    let events = collect_events(rx).await;
    let sequence: Vec<(String, &'static str)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::StepStart { name } => Some((name.clone(), "start")),
            StreamEvent::StepFinish { name, .. } => Some((name.clone(), "finish")),
            _ => None,
        })
        .collect();

    let position = |name: &str, phase: &str| {
        sequence
            .iter()
            .position(|(n, p)| n == name && *p == phase)
            .unwrap_or_else(|| panic!("missing {} {}", name, phase))
    };
    assert!(position("a", "finish") < position("b", "start"));
    assert!(position("a", "finish") < position("c", "start"));
    assert!(position("b", "finish") < position("d", "start"));
    assert!(position("c", "finish") < position("d", "start"));
}

#[tokio::test]
async fn input_wiring_delivers_upstream_output() {
    let workflow = Workflow::builder("wired")
        .step(value_step("fetch", json!({"rows": 3})))
        .step(
            Step::func("summarize", |input| async move {
                Ok(json!(format!("rows={}", input.input["rows"])))
            })
            .input_from("fetch.output"),
        )
        .build()
        .unwrap();

    let result = workflow
        .execute(&RunContext::new(), AgentTask::new("run"))
        .await
        .unwrap();
    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(outputs["summarize"], "rows=3");
}

#[tokio::test]
async fn for_each_reports_monotonic_progress_and_keeps_item_order() {
    let workflow = Workflow::builder("mapper")
        .step(value_step("items", json!([1, 2, 3, 4])))
        .step({
            let body: skein::workflow::StepFn = Arc::new(|input| {
                Box::pin(async move {
                    let n = input.input.as_i64().unwrap_or(0);
                    // Later items finish earlier.
                    tokio::time::sleep(Duration::from_millis(40 - 8 * n as u64)).await;
                    Ok(json!(n * 2))
                })
            });
            Step::for_each(
                "double",
                ItemsSource::From("items.output".into()),
                StepBody::Func(body),
            )
            .after("items")
        })
        .build()
        .unwrap();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(128, ctx.cancel.clone());
    let result = workflow
        .execute_stream(&ctx, AgentTask::new("run"), sink)
        .await
        .unwrap();

    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(outputs["double"], json!([2, 4, 6, 8]));

    let events = collect_events(rx).await;
    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::StepProgress {
                completed, total, ..
            } => Some((*completed, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[tokio::test]
async fn continue_policy_runs_independents_and_skips_consumers() {
    let workflow = Workflow::builder("partial")
        .step(
            Step::func("broken", |_input| async {
                Err(AgentError::Config("source unavailable".into()))
            })
            .on_error(ErrorPolicy::Continue),
        )
        .step(value_step("independent", json!("ran")).after("broken"))
        .step(
            Step::func("consumer", |input| async move { Ok(input.input) })
                .input_from("broken.output"),
        )
        .build()
        .unwrap();

    let result = workflow
        .execute(&RunContext::new(), AgentTask::new("run"))
        .await
        .unwrap();
    assert_eq!(result.stop, StopReason::Completed);

    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(outputs["independent"], "ran");
    assert!(outputs.get("consumer").is_none());

    let skipped = result
        .steps
        .iter()
        .find(|s| s.name == "consumer")
        .expect("consumer trace");
    assert!(skipped.error.as_deref().unwrap().contains("skipped"));
}

#[tokio::test]
async fn fail_fast_skips_everything_downstream() {
    let workflow = Workflow::builder("strict")
        .step(Step::func("explode", |_input| async {
            Err(AgentError::Config("boom".into()))
        }))
        .step(value_step("next", json!("never")).after("explode"))
        .build()
        .unwrap();

    let result = workflow
        .execute(&RunContext::new(), AgentTask::new("run"))
        .await
        .unwrap();
    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert!(outputs.get("next").is_none());
    let next = result.steps.iter().find(|s| s.name == "next").unwrap();
    assert!(next.error.as_deref().unwrap().contains("skipped"));
}

#[tokio::test]
async fn retry_policy_recovers_flaky_steps() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let workflow = Workflow::builder("flaky")
        .step(
            Step::func("wobbly", move |_input| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AgentError::Config("transient".into()))
                    } else {
                        Ok(json!("third time lucky"))
                    }
                }
            })
            .on_error(ErrorPolicy::Retry {
                attempts: 2,
                backoff: Duration::from_millis(1),
            }),
        )
        .build()
        .unwrap();

    let result = workflow
        .execute(&RunContext::new(), AgentTask::new("run"))
        .await
        .unwrap();
    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(outputs["wobbly"], "third time lucky");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn nested_agent_steps_forward_usage_and_events() {
    use skein::message::ChatResponse;
    use skein::{LlmAgent, MockProvider, TokenUsage};

    let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("sub answer")
        .with_usage(TokenUsage::new(6, 4)))]));
    let sub_agent = LlmAgent::builder("helper", provider).build();

    let workflow = Workflow::builder("delegating")
        .step(Step::agent("ask", Arc::new(sub_agent)))
        .build()
        .unwrap();

    let ctx = RunContext::new();
    let (sink, rx) = EventSink::channel(128, ctx.cancel.clone());
    let result = workflow
        .execute_stream(&ctx, AgentTask::new("question"), sink)
        .await
        .unwrap();

    assert_eq!(result.usage, TokenUsage::new(6, 4));
    let outputs: Value = serde_json::from_str(&result.output).unwrap();
    assert_eq!(outputs["ask"], "sub answer");

    // The inner agent's events came through the same channel.
    let events = collect_events(rx).await;
    let inner_kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert!(inner_kinds.contains(&"processing_start"));
    assert!(inner_kinds.contains(&"text_delta"));
    assert!(inner_kinds.contains(&"step_start"));
    assert!(inner_kinds.contains(&"step_finish"));
}
