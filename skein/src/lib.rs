//! # Skein
//!
//! A composable agent runtime: a provider-agnostic tool-calling loop,
//! router networks, and DAG workflows under one `Agent` contract, with a
//! typed stream-event bus, a processor pipeline, a sandboxed
//! code-execution bridge, and a memory/recall surface.
//!
//! ## Design principles
//!
//! - **One contract, three shapes**: [`LlmAgent`], [`Network`], and
//!   [`Workflow`] all implement [`Agent`] — `execute` and
//!   `execute_stream` — so they nest freely.
//! - **Tool errors are data**: validation and business failures travel in
//!   [`ToolResult::error`] for the model to see; only infrastructure
//!   problems raise [`AgentError`].
//! - **Single sink**: nested agents, tools, and workflow steps all write
//!   to one [`EventSink`]; the outermost `execute_stream` owns closing it.
//! - **Cooperative cancellation**: a `CancellationToken` in
//!   [`RunContext`] reaches every provider call, dispatch, and worker.
//!
//! ## Main modules
//!
//! - [`agent`]: [`Agent`], [`LlmAgent`], [`AgentTask`], [`AgentResult`],
//!   [`StepTrace`], [`Suspension`] — the tool-calling loop and its types.
//! - [`network`]: [`Network`] — a router provider over sub-agents.
//! - [`workflow`]: [`Workflow`], [`Step`] — declarative DAGs of
//!   functions, agents, and `for_each` fan-outs.
//! - [`provider`]: [`Provider`], [`EmbeddingProvider`], [`MockProvider`],
//!   and the retry / rate-limit / telemetry decorators.
//! - [`tool`]: [`Tool`], [`ToolRegistry`], [`ToolResult`], [`FnTool`].
//! - [`processor`]: pre-LLM / post-LLM / post-tool hooks and [`Signal`].
//! - [`sandbox`]: [`SubprocessExecutor`], [`HttpSandboxExecutor`],
//!   [`ExecuteCodeTool`], [`DispatchRegistry`] — the code-execution
//!   bridge.
//! - [`memory`]: [`Memory`], [`Store`], [`InMemoryStore`],
//!   [`SqliteStore`] — history, recall, and user facts.
//! - [`message`]: [`ChatMessage`], [`ChatRequest`], [`ChatResponse`].
//! - [`event`]: [`EventSink`] over `stream_event::StreamEvent`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skein::{AgentTask, LlmAgent, MockProvider, RunContext};
//! use skein::Agent;
//! use skein::message::ChatResponse;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let provider = Arc::new(MockProvider::new(vec![Ok(ChatResponse::text("hello"))]));
//! let agent = LlmAgent::builder("greeter", provider)
//!     .system_prompt("You greet people.")
//!     .build();
//!
//! let ctx = RunContext::new();
//! let result = agent.execute(&ctx, AgentTask::new("hi")).await.unwrap();
//! println!("{}", result.output);
//! # }
//! ```

pub mod agent;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod network;
pub mod processor;
pub mod provider;
pub mod sandbox;
pub mod tool;
pub mod workflow;

pub use agent::{
    Agent, AgentResult, AgentTask, LlmAgent, LlmAgentBuilder, RunContext, StepTrace, StopReason,
    Suspension, SystemPrompt,
};
pub use error::{
    AgentError, ProviderError, SandboxError, StoreError, ToolError, WorkflowBuildError,
};
pub use event::EventSink;
pub use memory::{Embedder, InMemoryStore, Memory, MockEmbedder, SqliteStore, Store};
pub use message::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};
pub use network::{Network, RoutingDecision};
pub use processor::{
    PostLlmProcessor, PostToolProcessor, PreLlmProcessor, ProcessorContext, Signal,
};
pub use provider::{
    decorate, EmbeddingProvider, MockProvider, Provider, ProviderDelta, RateLimitProvider,
    RetryConfig, RetryProvider, TelemetryProvider,
};
pub use sandbox::{
    DispatchRegistry, ExecuteCodeTool, HttpSandboxExecutor, SubprocessExecutor, TOOL_EXECUTE_CODE,
};
pub use stream_event::{StreamEvent, TokenUsage};
pub use tool::{FnTool, Tool, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
pub use workflow::{
    ErrorPolicy, ItemsSource, Step, StepBody, StepInput, StepKind, Workflow, WorkflowBuilder,
};
