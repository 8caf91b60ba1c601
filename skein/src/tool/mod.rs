//! Tool contract: named operations with a JSON-schema input and a
//! content-or-error output.
//!
//! A tool advertises one or more [`ToolDefinition`]s and executes by name.
//! Failures a model should see (bad arguments, business failures) are
//! returned inside [`ToolResult::error`]; an `Err` from `execute` is
//! reserved for infrastructure problems (cancellation, dispatch failure).

mod registry;

pub use registry::ToolRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::event::EventSink;

/// What a tool advertises to the model: name, description, and a JSON
/// schema for its arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Outcome of one tool execution: content XOR error.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text appended to history: the content, or the error prefixed so
    /// the model can recognize and react to the failure.
    pub fn history_text(&self) -> String {
        match &self.error {
            Some(e) => format!("error: {}", e),
            None => self.content.clone(),
        }
    }
}

/// Per-call context handed to every tool execution.
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    /// Set when the call originates from inside the code-execution sandbox;
    /// `execute_code` refuses to dispatch in that case.
    pub from_sandbox: bool,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            thread_id: None,
            user_id: None,
            from_sandbox: false,
            cancel,
        }
    }

    pub fn for_sandbox(&self) -> Self {
        let mut ctx = self.clone();
        ctx.from_sandbox = true;
        ctx
    }
}

/// A tool. One implementation may serve several definitions (dispatch on
/// `name`).
#[async_trait]
pub trait Tool: Send + Sync {
    /// The definitions this tool serves. Names must be unique within a
    /// registry.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Executes `name` with `args`. Validation and business failures go in
    /// `ToolResult::error`; `Err` is reserved for infrastructure failures.
    async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
    ) -> Result<ToolResult, ToolError>;

    /// Streaming variant: may emit `tool_progress` events through `sink`
    /// (tagged with `call_id`). The default forwards to the blocking path,
    /// so tools without incremental output need not implement it.
    async fn execute_stream(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
        _sink: &EventSink,
        _call_id: &str,
    ) -> Result<ToolResult, ToolError> {
        self.execute(ctx, name, args).await
    }
}

type BoxedToolFn = Box<
    dyn Fn(ToolContext, Value) -> futures::future::BoxFuture<'static, ToolResult> + Send + Sync,
>;

/// A tool built from a closure; the common case for inline tools.
pub struct FnTool {
    definition: ToolDefinition,
    f: BoxedToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(definition: ToolDefinition, f: F) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ToolResult> + Send + 'static,
    {
        Self {
            definition,
            f: Box::new(move |ctx, args| Box::pin(f(ctx, args))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![self.definition.clone()]
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _name: &str,
        args: Value,
    ) -> Result<ToolResult, ToolError> {
        Ok((self.f)(ctx.clone(), args).await)
    }
}
