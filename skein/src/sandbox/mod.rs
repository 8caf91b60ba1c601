//! Code-execution bridge: sandboxed code that can call back into the
//! agent's tools.
//!
//! Two executors share one protocol ([`protocol::BridgeFrame`]): a local
//! subprocess with a bundled prelude, and a remote sandbox service that
//! calls back over HTTP. Both refuse recursive `execute_code`, reject
//! process-spawning code up front, and drain their dispatch channels on
//! shutdown.

mod blocklist;
mod http;
mod protocol;
mod registry;
mod subprocess;
mod tool;

pub use blocklist::find_blocked_pattern;
pub use http::HttpSandboxExecutor;
pub use protocol::{
    BridgeCall, BridgeFrame, SandboxFile, SandboxRequest, SandboxResponse, ToolCallbackRequest,
    ToolCallbackResponse,
};
pub use registry::{dispatch_worker, DispatchRegistry, PendingToolCall};
pub use subprocess::SubprocessExecutor;
pub use tool::ExecuteCodeTool;

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::tool::ToolContext;

/// Tool name the bridge is exposed under.
pub const TOOL_EXECUTE_CODE: &str = "execute_code";

/// One code execution request.
#[derive(Clone, Debug)]
pub struct CodeRequest {
    pub code: String,
    pub runtime: String,
    pub session_id: Option<String>,
    pub timeout: Option<std::time::Duration>,
    pub files: Vec<SandboxFile>,
}

impl CodeRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            runtime: "python".to_string(),
            session_id: None,
            timeout: None,
            files: Vec::new(),
        }
    }
}

/// Outcome of one code execution.
#[derive(Clone, Debug, Default)]
pub struct CodeOutcome {
    pub output: String,
    pub logs: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub files: Vec<SandboxFile>,
}

/// A sandbox backend.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &ToolContext,
        request: CodeRequest,
    ) -> Result<CodeOutcome, SandboxError>;
}
