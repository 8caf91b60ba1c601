//! App state and router assembly.

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::post;
use axum::Router;

use skein::sandbox::DispatchRegistry;
use skein::Agent;

/// Shared state: the agents servable by name and the sandbox dispatch
/// registry behind the callback endpoint.
pub struct AppState {
    agents: HashMap<String, Arc<dyn Agent>>,
    registry: Arc<DispatchRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<DispatchRegistry>) -> Self {
        Self {
            agents: HashMap::new(),
            registry,
        }
    }

    pub fn register_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }
}

/// Builds the router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/agents/:name/stream", post(crate::sse::stream_handler))
        .route("/callbacks/tools", post(crate::callback::tool_callback))
        .with_state(state)
}

/// Dev logging setup: env-filtered subscriber (`RUST_LOG`).
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Startup config: applies the `.env` / XDG layer stack to the process
/// environment, then reads the typed runtime settings back out.
pub fn load_settings() -> config::RuntimeSettings {
    match config::load_and_apply("skein", None) {
        Ok(applied) => {
            for var in &applied {
                tracing::debug!(key = %var.key, layer = var.layer, "config var applied");
            }
        }
        Err(e) => tracing::warn!(error = %e, "config load failed, using environment as-is"),
    }
    config::RuntimeSettings::from_env()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skein::{AgentError, AgentResult, AgentTask, RunContext};

    struct NullAgent;

    #[async_trait]
    impl Agent for NullAgent {
        fn name(&self) -> &str {
            "null"
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            _task: AgentTask,
        ) -> Result<AgentResult, AgentError> {
            Ok(AgentResult::default())
        }
    }

    #[test]
    fn agents_resolve_by_name() {
        let state = AppState::new(Arc::new(DispatchRegistry::new()))
            .register_agent(Arc::new(NullAgent));
        assert!(state.agent("null").is_some());
        assert!(state.agent("other").is_none());
    }
}
