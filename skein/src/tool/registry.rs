//! Tool registry: the name → tool map one agent dispatches against.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use crate::error::ToolError;
use crate::event::EventSink;

use super::{Tool, ToolContext, ToolDefinition, ToolResult};

/// Maximum length of a recovered panic message inside a tool result.
const PANIC_MESSAGE_LIMIT: usize = 256;

/// Registry of tools keyed by definition name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under every definition name it advertises.
    /// A duplicate name replaces the earlier mapping.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let index = self.tools.len();
        for def in tool.definitions() {
            if self.by_name.insert(def.name.clone(), index).is_some() {
                warn!(tool = %def.name, "tool name re-registered, replacing earlier mapping");
            }
        }
        self.tools.push(tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// The catalog advertised to the provider. Only live mappings are
    /// listed; a definition shadowed by re-registration is dropped.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for (index, tool) in self.tools.iter().enumerate() {
            for def in tool.definitions() {
                if self.by_name.get(&def.name).copied() == Some(index) {
                    defs.push(def);
                }
            }
        }
        defs
    }

    /// Dispatches one call.
    ///
    /// Unknown names and panics inside tool code come back as
    /// `ToolResult::error` so the loop continues; only cancellation and
    /// suspension propagate as `Err`.
    pub async fn dispatch(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
        sink: &EventSink,
        call_id: &str,
    ) -> Result<ToolResult, ToolError> {
        let Some(&index) = self.by_name.get(name) else {
            return Ok(ToolResult::error(format!("unknown tool: {}", name)));
        };
        let tool = &self.tools[index];

        let span = tracing::info_span!("agent.tool.call", tool = %name, call_id = %call_id);
        let fut = tracing::Instrument::instrument(
            tool.execute_stream(ctx, name, args, sink, call_id),
            span,
        );
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(ToolError::Cancelled)) => Err(ToolError::Cancelled),
            Ok(Err(ToolError::Suspended(payload))) => Err(ToolError::Suspended(payload)),
            Ok(Err(other)) => {
                // Infrastructure failure reported by the tool itself;
                // surfaced to the model as an error result.
                Ok(ToolResult::error(other.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic);
                warn!(tool = %name, %message, "tool panicked, recovered at dispatch boundary");
                Ok(ToolResult::error(format!("tool panicked: {}", message)))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let raw = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    if raw.len() > PANIC_MESSAGE_LIMIT {
        format!("{}...", &raw[..PANIC_MESSAGE_LIMIT])
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FnTool;
    use async_trait::async_trait;
    use serde_json::json;

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::new("boom", "always panics", json!({}))]
        }

        async fn execute(
            &self,
            _ctx: &ToolContext,
            _name: &str,
            _args: Value,
        ) -> Result<ToolResult, ToolError> {
            panic!("exploded while handling args");
        }
    }

    fn echo_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FnTool::new(
            ToolDefinition::new("echo", "echoes", json!({"type": "object"})),
            |_ctx, args| async move { ToolResult::ok(args["n"].to_string()) },
        )));
        reg
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_an_error_result() {
        let reg = echo_registry();
        let out = reg
            .dispatch(
                &ToolContext::default(),
                "missing",
                json!({}),
                &EventSink::noop(),
                "c1",
            )
            .await
            .unwrap();
        assert!(out.is_error());
        assert!(out.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn dispatch_recovers_panics() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(PanickingTool));
        let out = reg
            .dispatch(
                &ToolContext::default(),
                "boom",
                json!({}),
                &EventSink::noop(),
                "c1",
            )
            .await
            .unwrap();
        assert!(out.is_error());
        let msg = out.error.unwrap();
        assert!(msg.contains("tool panicked"), "{}", msg);
        assert!(msg.contains("exploded"), "{}", msg);
    }

    #[test]
    fn definitions_lists_registered_names() {
        let reg = echo_registry();
        let names: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo"]);
        assert!(reg.contains("echo"));
        assert!(!reg.contains("other"));
    }
}
