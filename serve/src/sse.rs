//! SSE adapter: one agent run as a `text/event-stream` response.
//!
//! Each stream event becomes an SSE record with `event:` set to the event
//! kind and `data:` to its JSON; the stream ends with exactly one
//! terminal record — `event: done` carrying the full result JSON, or
//! `event: error` with `{"error": message}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use skein::{Agent, AgentTask, EventSink, RunContext};
use stream_event::{done_record, error_record, to_sse_record, SseRecord};

use crate::app::AppState;

/// Buffered event channel between the run and the HTTP writer.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub input: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub(crate) async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<StreamRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let agent = state.agent(&name).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown agent: {}", name),
            }),
        )
    })?;

    let mut task = AgentTask::new(request.input);
    task.thread_id = request.thread_id;
    task.user_id = request.user_id;

    let stream = sse_events(agent, task);
    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    Ok((
        [(CACHE_CONTROL, "no-cache"), (CONNECTION, "keep-alive")],
        sse,
    ))
}

/// Runs `execute_stream` and shapes the event flow into SSE records.
/// Usable without the router for custom servers.
pub fn sse_events(
    agent: Arc<dyn Agent>,
    task: AgentTask,
) -> impl Stream<Item = Result<Event, Infallible>> {
    sse_records(agent, task)
        .map(|record| Ok(Event::default().event(record.event).data(record.data)))
}

/// The raw record stream behind [`sse_events`]: every stream event as a
/// record, then exactly one `done` or `error` terminal.
pub fn sse_records(agent: Arc<dyn Agent>, task: AgentTask) -> impl Stream<Item = SseRecord> {
    let (record_tx, record_rx) = mpsc::channel::<SseRecord>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let ctx = RunContext::with_cancel(cancel.clone());
        let (sink, mut events) = EventSink::channel(CHANNEL_CAPACITY, cancel.clone());

        let run = tokio::spawn(async move { agent.execute_stream(&ctx, task, sink).await });

        // Forward until the runtime closes the event channel.
        while let Some(event) = events.recv().await {
            match to_sse_record(&event) {
                Ok(record) => {
                    if record_tx.send(record).await.is_err() {
                        // Client went away; stop the run.
                        cancel.cancel();
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize stream event"),
            }
        }

        let terminal = match run.await {
            Ok(Ok(result)) => done_record(&result.to_value()),
            Ok(Err(err)) => error_record(&err.to_string()),
            Err(join_err) => error_record(&format!("run task failed: {}", join_err)),
        };
        let _ = record_tx.send(terminal).await;
    });

    ReceiverStream::new(record_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skein::{AgentError, AgentResult, StreamEvent};

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            task: AgentTask,
        ) -> Result<AgentResult, AgentError> {
            Ok(AgentResult {
                output: task.input,
                ..Default::default()
            })
        }

        async fn execute_stream(
            &self,
            ctx: &RunContext,
            task: AgentTask,
            sink: EventSink,
        ) -> Result<AgentResult, AgentError> {
            sink.emit(StreamEvent::TextDelta {
                content: task.input.clone(),
            })
            .await;
            self.execute(ctx, task).await
        }
    }

    #[tokio::test]
    async fn stream_ends_with_done_record() {
        let stream = sse_records(Arc::new(EchoAgent), AgentTask::new("hello"));
        tokio::pin!(stream);

        let mut records = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record);
        }
        assert!(records.len() >= 2, "at least one event plus the terminal");
        assert_eq!(records[0].event, "text_delta");
        let last = records.last().unwrap();
        assert_eq!(last.event, "done");
        let body: serde_json::Value = serde_json::from_str(&last.data).unwrap();
        assert_eq!(body["output"], "hello");
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            _task: AgentTask,
        ) -> Result<AgentResult, AgentError> {
            Err(AgentError::Config("misconfigured".into()))
        }
    }

    #[tokio::test]
    async fn failures_end_with_an_error_record() {
        let stream = sse_records(Arc::new(FailingAgent), AgentTask::new("x"));
        tokio::pin!(stream);

        let mut last = None;
        while let Some(record) = stream.next().await {
            last = Some(record);
        }
        let last = last.unwrap();
        assert_eq!(last.event, "error");
        let body: serde_json::Value = serde_json::from_str(&last.data).unwrap();
        assert!(body["error"].as_str().unwrap().contains("misconfigured"));
    }
}
