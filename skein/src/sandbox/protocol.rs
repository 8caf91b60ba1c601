//! Wire protocol of the code-execution bridge.
//!
//! Five newline-delimited JSON frame kinds flow between the runtime and
//! sandbox code: `tool_call`, `tool_calls_parallel`, `tool_result`,
//! `tool_error`, `result`. The HTTP variant wraps tool calls in callback
//! envelopes keyed by `execution_id`; the subprocess variant sends the
//! frames straight over stdio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One frame on the bridge.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    /// Sandbox → runtime: run one tool.
    ToolCall { id: String, name: String, args: Value },
    /// Sandbox → runtime: run several tools concurrently.
    ToolCallsParallel { id: String, calls: Vec<BridgeCall> },
    /// Runtime → sandbox: a call succeeded.
    ToolResult { id: String, data: Value },
    /// Runtime → sandbox: a call failed; the prelude raises this as a
    /// language-native error user code can catch.
    ToolError { id: String, error: String },
    /// Sandbox → runtime: the user code's final value.
    Result { value: Value },
}

/// One entry of a `tool_calls_parallel` frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BridgeCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl BridgeFrame {
    /// Parses one NDJSON line; non-frame lines are `None` so interleaved
    /// print output cannot break the bridge.
    pub fn parse_line(line: &str) -> Option<BridgeFrame> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Renders the frame as one NDJSON line (trailing newline included).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }
}

/// Request the runtime POSTs to the remote sandbox service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub execution_id: String,
    pub callback_url: String,
    pub code: String,
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Seconds.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<SandboxFile>,
}

/// The sandbox service's reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<SandboxFile>,
}

/// A file moved across the sandbox boundary. `data` is base64.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SandboxFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SandboxFile {
    /// Approximate decoded size of the payload.
    pub fn payload_bytes(&self) -> usize {
        self.data.as_ref().map(|d| d.len() * 3 / 4).unwrap_or(0)
    }

    /// Drops the payload, keeping name and mime only.
    pub fn metadata_only(mut self) -> Self {
        self.data = None;
        self
    }
}

/// Envelope the sandbox POSTs to the callback endpoint for each tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallbackRequest {
    pub execution_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The runtime's reply to a callback envelope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolCallbackResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallbackResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}
