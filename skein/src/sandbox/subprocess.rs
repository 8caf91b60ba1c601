//! Subprocess sandbox: a local interpreter with the bridge prelude.
//!
//! The runtime spawns `python3 -c <prelude>` with the user code in an
//! environment variable, reads frames off the child's stdout, dispatches
//! `tool_call` / `tool_calls_parallel` through the host registry, and
//! writes the matching replies to the child's stdin. Stderr is collected
//! as logs; timeout and cancellation kill the child.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::event::EventSink;
use crate::tool::{ToolContext, ToolRegistry};

use super::blocklist::find_blocked_pattern;
use super::protocol::{BridgeCall, BridgeFrame, SandboxFile};
use super::{CodeExecutor, CodeOutcome, CodeRequest, TOOL_EXECUTE_CODE};

const PRELUDE: &str = include_str!("prelude.py");

pub struct SubprocessExecutor {
    tools: Arc<ToolRegistry>,
    interpreter: String,
    timeout: std::time::Duration,
    max_parallel: usize,
}

impl SubprocessExecutor {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            interpreter: "python3".to_string(),
            timeout: std::time::Duration::from_secs(60),
            max_parallel: 10,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_parallel(mut self, cap: usize) -> Self {
        self.max_parallel = cap.max(1);
        self
    }

    async fn dispatch_one(&self, ctx: &ToolContext, name: &str, args: Value) -> Result<Value, String> {
        if name == TOOL_EXECUTE_CODE {
            return Err("execute_code cannot be invoked from inside the sandbox".to_string());
        }
        match self
            .tools
            .dispatch(ctx, name, args, &EventSink::noop(), "sandbox")
            .await
        {
            Ok(result) => match result.error {
                None => Ok(Value::String(result.content)),
                Some(error) => Err(error),
            },
            Err(err) => Err(err.to_string()),
        }
    }

    async fn dispatch_batch(&self, ctx: &ToolContext, calls: Vec<BridgeCall>) -> Vec<Value> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let futures = calls.into_iter().map(|call| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                match self.dispatch_one(ctx, &call.name, call.args).await {
                    Ok(data) => serde_json::json!({ "data": data }),
                    Err(error) => serde_json::json!({ "error": error }),
                }
            }
        });
        join_all(futures).await
    }
}

#[async_trait]
impl CodeExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        ctx: &ToolContext,
        request: CodeRequest,
    ) -> Result<CodeOutcome, SandboxError> {
        if let Some(pattern) = find_blocked_pattern(&request.code) {
            return Err(SandboxError::Blocked(pattern.to_string()));
        }

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(PRELUDE)
            .env("SKEIN_USER_CODE", &request.code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("no stderr pipe".into()))?;

        // Stderr drains concurrently so a chatty child cannot deadlock on
        // a full pipe; joined before returning.
        let log_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut logs = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push_str(&line);
                logs.push('\n');
            }
            logs
        });

        let sandbox_ctx = ctx.for_sandbox();
        let timeout = request.timeout.unwrap_or(self.timeout);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut lines = BufReader::new(stdout).lines();
        let mut result_value: Option<Value> = None;

        let outcome: Result<(), SandboxError> = loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let _ = child.start_kill();
                    break Err(SandboxError::Cancelled);
                }
                _ = &mut deadline => {
                    let _ = child.start_kill();
                    break Err(SandboxError::Timeout);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(frame) = BridgeFrame::parse_line(&line) else {
                            continue; // interleaved print output
                        };
                        match frame {
                            BridgeFrame::ToolCall { id, name, args } => {
                                debug!(tool = %name, "sandbox tool call");
                                let reply = match self.dispatch_one(&sandbox_ctx, &name, args).await {
                                    Ok(data) => BridgeFrame::ToolResult { id, data },
                                    Err(error) => BridgeFrame::ToolError { id, error },
                                };
                                let line = reply
                                    .to_line()
                                    .map_err(|e| SandboxError::Protocol(e.to_string()));
                                match line {
                                    Ok(line) => {
                                        if stdin.write_all(line.as_bytes()).await.is_err() {
                                            break Err(SandboxError::Protocol(
                                                "sandbox stdin closed".into(),
                                            ));
                                        }
                                    }
                                    Err(e) => break Err(e),
                                }
                            }
                            BridgeFrame::ToolCallsParallel { id, calls } => {
                                debug!(batch = calls.len(), "sandbox parallel tool calls");
                                let data = self.dispatch_batch(&sandbox_ctx, calls).await;
                                let reply = BridgeFrame::ToolResult {
                                    id,
                                    data: Value::Array(data),
                                };
                                match reply.to_line() {
                                    Ok(line) => {
                                        if stdin.write_all(line.as_bytes()).await.is_err() {
                                            break Err(SandboxError::Protocol(
                                                "sandbox stdin closed".into(),
                                            ));
                                        }
                                    }
                                    Err(e) => break Err(SandboxError::Protocol(e.to_string())),
                                }
                            }
                            BridgeFrame::Result { value } => {
                                result_value = Some(value);
                            }
                            other => {
                                warn!(?other, "unexpected frame from sandbox");
                            }
                        }
                    }
                    Ok(None) => break Ok(()), // EOF: child is done
                    Err(e) => break Err(SandboxError::Protocol(e.to_string())),
                }
            }
        };

        let logs = match &outcome {
            // Child killed: don't wait on a pipe that may stay open.
            Err(SandboxError::Cancelled) | Err(SandboxError::Timeout) => {
                log_task.abort();
                let _ = log_task.await;
                String::new()
            }
            _ => log_task.await.unwrap_or_default(),
        };
        outcome?;

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .map_err(|_| SandboxError::Protocol("sandbox did not exit after EOF".into()))?
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;
        let exit_code = status.code().unwrap_or(-1);

        let output = match result_value {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let error = (exit_code != 0).then(|| {
            let tail: String = logs.lines().last().unwrap_or("sandbox failed").to_string();
            tail
        });

        Ok(CodeOutcome {
            output,
            logs,
            exit_code,
            error,
            files: Vec::<SandboxFile>::new(),
        })
    }
}
