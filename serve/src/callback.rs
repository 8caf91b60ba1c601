//! Sandbox tool-callback endpoint.
//!
//! The remote sandbox POSTs `{execution_id, name, args}` envelopes here;
//! the registry routes each to its execution's dispatch queue and the
//! reply body is `{data?}` or `{error?}`. Envelopes for unknown or
//! finished executions come back as errors immediately.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use skein::sandbox::{ToolCallbackRequest, ToolCallbackResponse};

use crate::app::AppState;

pub(crate) async fn tool_callback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolCallbackRequest>,
) -> Json<ToolCallbackResponse> {
    Json(state.registry().dispatch(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein::sandbox::DispatchRegistry;
    use skein::{EventSink, ToolContext, ToolRegistry};

    #[tokio::test]
    async fn callback_routes_through_the_registry() {
        let registry = Arc::new(DispatchRegistry::new());
        let state = Arc::new(AppState::new(Arc::clone(&registry)));

        let queue = registry.register("e1");
        let worker = tokio::spawn(skein::sandbox::dispatch_worker(
            queue,
            Arc::new(ToolRegistry::new()),
            ToolContext::default(),
            EventSink::noop(),
        ));

        let response = tool_callback(
            State(state),
            Json(ToolCallbackRequest {
                execution_id: "e1".into(),
                name: "missing".into(),
                args: serde_json::json!({}),
            }),
        )
        .await;
        // Empty registry: unknown tool, reported as the call's error.
        assert!(response.0.error.as_deref().unwrap().contains("unknown tool"));

        registry.deregister("e1");
        worker.await.unwrap();
    }
}
