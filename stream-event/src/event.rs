//! The event union: everything incremental that leaves a run.
//!
//! One channel per `execute_stream` invocation carries these; the runtime
//! closes the channel (sender drop) after the final event. Per-source order
//! is preserved; interleaving across concurrent sources is not.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage for one provider call or one whole run (summed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt (input).
    pub input_tokens: u32,
    /// Tokens in the completion (output).
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens (input + output).
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Adds another usage into this one. Used by the runtime to keep
    /// run totals equal to the sum of inner operations.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One stream event: wire shape is `{"type": "<kind>", ...payload}`.
///
/// Pairing invariant: every `ToolCallStart { id }` is matched by exactly one
/// `ToolCallResult` with the same `id` before the channel closes, error or not.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The caller's input reached the runtime.
    InputReceived { input: String },
    /// An iteration is about to call the provider.
    ProcessingStart { agent: String },
    /// Model reasoning surfaced before the answer (providers that expose it).
    Thinking { content: String },
    /// Incremental assistant text from a streaming provider call.
    TextDelta { content: String },
    /// Incremental tool-call arguments from a streaming provider call,
    /// keyed by the provider's call id.
    ToolCallDelta {
        id: String,
        name: Option<String>,
        arguments_delta: String,
    },
    /// A tool dispatch is starting; `id` is the provider's call id.
    ToolCallStart { id: String, name: String, args: Value },
    /// Mid-execution progress from a streaming tool.
    ToolProgress { id: String, name: String, data: Value },
    /// A tool dispatch finished. `error` is set when the tool reported
    /// failure; the pairing with `ToolCallStart` holds either way.
    ToolCallResult {
        id: String,
        name: String,
        content: String,
        error: Option<String>,
        duration_ms: u64,
    },
    /// The router picked sub-agents (and optionally tools) for this turn.
    RoutingDecision {
        agents: Vec<String>,
        tools: Vec<String>,
    },
    /// A delegated sub-agent is starting.
    AgentStart { name: String },
    /// A delegated sub-agent finished; `error` carries its failure text.
    AgentFinish {
        name: String,
        output: String,
        error: Option<String>,
        usage: TokenUsage,
        duration_ms: u64,
    },
    /// A workflow step is starting.
    StepStart { name: String },
    /// Fan-out progress inside a for-each step; `completed` is monotonic.
    StepProgress {
        name: String,
        completed: usize,
        total: usize,
    },
    /// A workflow step finished.
    StepFinish {
        name: String,
        output: Value,
        error: Option<String>,
        duration_ms: u64,
    },
}

impl StreamEvent {
    /// The snake_case tag, as serialized into `"type"` and used as the SSE
    /// `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::InputReceived { .. } => "input_received",
            StreamEvent::ProcessingStart { .. } => "processing_start",
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ToolCallDelta { .. } => "tool_call_delta",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolProgress { .. } => "tool_progress",
            StreamEvent::ToolCallResult { .. } => "tool_call_result",
            StreamEvent::RoutingDecision { .. } => "routing_decision",
            StreamEvent::AgentStart { .. } => "agent_start",
            StreamEvent::AgentFinish { .. } => "agent_finish",
            StreamEvent::StepStart { .. } => "step_start",
            StreamEvent::StepProgress { .. } => "step_progress",
            StreamEvent::StepFinish { .. } => "step_finish",
        }
    }

    /// Serializes this event to a JSON object (`type` + payload).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
