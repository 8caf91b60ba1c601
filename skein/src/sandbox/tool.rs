//! `execute_code`: the sandbox exposed as a regular tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{SandboxError, ToolError};
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolResult};

use super::{CodeExecutor, CodeRequest, TOOL_EXECUTE_CODE};

pub struct ExecuteCodeTool {
    executor: Arc<dyn CodeExecutor>,
}

impl ExecuteCodeTool {
    pub fn new(executor: Arc<dyn CodeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            TOOL_EXECUTE_CODE,
            "Run code in a sandbox. The code can call the agent's other tools \
             via call_tool(name, args) and call_tools_parallel([...]), and \
             reports its value with set_result(value).",
            json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "The code to run." },
                    "runtime": {
                        "type": "string",
                        "description": "Interpreter runtime.",
                        "default": "python"
                    }
                },
                "required": ["code"]
            }),
        )]
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _name: &str,
        args: Value,
    ) -> Result<ToolResult, ToolError> {
        // No recursion: a sandboxed program cannot start another sandbox.
        if ctx.from_sandbox {
            return Ok(ToolResult::error(
                "execute_code cannot be invoked from inside the sandbox",
            ));
        }

        let Some(code) = args.get("code").and_then(|v| v.as_str()) else {
            return Ok(ToolResult::error("missing required argument 'code'"));
        };
        let runtime = args
            .get("runtime")
            .and_then(|v| v.as_str())
            .unwrap_or("python")
            .to_string();

        let request = CodeRequest {
            code: code.to_string(),
            runtime,
            session_id: ctx.thread_id.clone(),
            timeout: None,
            files: Vec::new(),
        };

        match self.executor.execute(ctx, request).await {
            Ok(outcome) => {
                if let Some(error) = outcome.error {
                    Ok(ToolResult::error(format!(
                        "sandbox execution failed (exit {}): {}",
                        outcome.exit_code, error
                    )))
                } else {
                    Ok(ToolResult::ok(outcome.output))
                }
            }
            Err(SandboxError::Cancelled) => Err(ToolError::Cancelled),
            Err(err) => Ok(ToolResult::error(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CodeOutcome;

    struct FixedExecutor;

    #[async_trait]
    impl CodeExecutor for FixedExecutor {
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _request: CodeRequest,
        ) -> Result<CodeOutcome, SandboxError> {
            Ok(CodeOutcome {
                output: "hi".into(),
                logs: String::new(),
                exit_code: 0,
                error: None,
                files: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn refuses_calls_from_inside_the_sandbox() {
        let tool = ExecuteCodeTool::new(Arc::new(FixedExecutor));
        let mut ctx = ToolContext::default();
        ctx.from_sandbox = true;
        let result = tool
            .execute(&ctx, TOOL_EXECUTE_CODE, json!({"code": "1"}))
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("inside the sandbox"));
    }

    #[tokio::test]
    async fn forwards_output_on_success() {
        let tool = ExecuteCodeTool::new(Arc::new(FixedExecutor));
        let result = tool
            .execute(&ToolContext::default(), TOOL_EXECUTE_CODE, json!({"code": "x"}))
            .await
            .unwrap();
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn missing_code_is_a_validation_error() {
        let tool = ExecuteCodeTool::new(Arc::new(FixedExecutor));
        let result = tool
            .execute(&ToolContext::default(), TOOL_EXECUTE_CODE, json!({}))
            .await
            .unwrap();
        assert!(result.error.unwrap().contains("missing"));
    }
}
