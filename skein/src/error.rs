//! Error taxonomy for the runtime.
//!
//! Tool errors are data: validation and business failures travel inside
//! `ToolResult::error` so the model can see them and self-correct. Only
//! infrastructure problems (transport, cancellation, dispatch panics that
//! escape recovery) are raised up the call stack as these enums.

use thiserror::Error;

/// Failure of a provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Server-side failure (5xx or equivalent).
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Network-level failure: timeout, connect refused/reset, EOF.
    #[error("network: {0}")]
    Network(String),

    /// The backend replied with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Anything else (misconfiguration, exhausted mock scripts, ...).
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry decorator should try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
        )
    }
}

/// Infrastructure failure during tool dispatch.
///
/// `Suspended` is not a failure: it is the control signal a
/// human-in-the-loop tool raises to pause the run. The loop intercepts it
/// and turns it into a suspension marker; it never reaches the caller as
/// an error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool dispatch cancelled")]
    Cancelled,

    /// Control signal: pause the run and ask the caller for input.
    #[error("tool requested suspension")]
    Suspended(serde_json::Value),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Failure in the code-execution bridge.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(String),

    #[error("sandbox protocol violation: {0}")]
    Protocol(String),

    #[error("user code rejected by block-list: {0}")]
    Blocked(String),

    #[error("sandbox HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("sandbox network error: {0}")]
    Network(String),

    #[error("sandbox execution timed out")]
    Timeout,

    #[error("sandbox execution cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Transient conditions worth retrying against the remote sandbox:
    /// network timeouts, connection failures, and 5xx replies.
    pub fn is_transient(&self) -> bool {
        match self {
            SandboxError::Network(_) => true,
            SandboxError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Failure of the memory store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store backend: {0}")]
    Backend(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validation failure while building a workflow graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowBuildError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' wires input from unknown step '{reference}'")]
    UnknownInput { step: String, reference: String },

    #[error("workflow graph contains a cycle")]
    Cycle,
}

/// Top-level execution error returned by `Agent::execute`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool: {0}")]
    Tool(#[from] ToolError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("workflow: {0}")]
    WorkflowBuild(#[from] WorkflowBuildError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("suspension already consumed")]
    SuspensionConsumed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_provider_errors() {
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(ProviderError::Network("timeout".into()).is_transient());
        assert!(!ProviderError::InvalidResponse("bad json".into()).is_transient());
        assert!(!ProviderError::Other("config".into()).is_transient());
    }

    #[test]
    fn transient_sandbox_errors() {
        assert!(SandboxError::Network("connection reset".into()).is_transient());
        assert!(SandboxError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!SandboxError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!SandboxError::Blocked("subprocess".into()).is_transient());
    }

    #[test]
    fn error_display_includes_context() {
        let err = AgentError::from(ProviderError::Server {
            status: 500,
            message: "boom".into(),
        });
        let s = err.to_string();
        assert!(s.contains("provider"), "{}", s);
        assert!(s.contains("500"), "{}", s);
    }
}
