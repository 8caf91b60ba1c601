//! The single-provider agent: the tool-calling loop.
//!
//! One iteration: assemble messages, run pre-LLM processors, call the
//! provider, trace the step, dispatch any tool calls in parallel, run
//! post-tool processors, repeat. The loop ends when the provider returns
//! plain text, a processor halts or suspends, the iteration cap is hit,
//! or the caller cancels.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::AgentError;
use crate::event::EventSink;
use crate::memory::Memory;
use crate::message::{ChatMessage, ChatRequest, ChatResponse, ToolCall};
use crate::processor::{
    PostLlmProcessor, PostToolProcessor, PreLlmProcessor, ProcessorContext, Signal,
};
use crate::provider::{Provider, ProviderDelta};
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
use stream_event::{StreamEvent, TokenUsage};

use super::dispatch::{dispatch_parallel, DispatchOutcome};
use super::plan::{plan_tool_definition, run_plan, TOOL_EXECUTE_PLAN};
use super::suspend::Suspension;
use super::{Agent, AgentResult, AgentTask, RunContext, StepTrace, StopReason};

/// System prompt source: fixed text or a per-task closure.
#[derive(Clone, Default)]
pub enum SystemPrompt {
    #[default]
    None,
    Static(String),
    Dynamic(Arc<dyn Fn(&AgentTask) -> String + Send + Sync>),
}

impl SystemPrompt {
    fn render(&self, task: &AgentTask) -> Option<String> {
        match self {
            SystemPrompt::None => None,
            SystemPrompt::Static(text) => Some(text.clone()),
            SystemPrompt::Dynamic(f) => Some(f(task)),
        }
    }
}

/// Builder for [`LlmAgent`]. `LlmAgent::builder(name, provider)` is the
/// entry point of the programmatic API.
pub struct LlmAgentBuilder {
    name: String,
    description: String,
    provider: Arc<dyn Provider>,
    system_prompt: SystemPrompt,
    tools: ToolRegistry,
    pre: Vec<Arc<dyn PreLlmProcessor>>,
    post: Vec<Arc<dyn PostLlmProcessor>>,
    post_tool: Vec<Arc<dyn PostToolProcessor>>,
    max_iterations: usize,
    max_parallel_tools: usize,
    plan_execution: bool,
    memory: Option<Arc<Memory>>,
}

impl LlmAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = SystemPrompt::Static(prompt.into());
        self
    }

    /// System prompt computed per task (dynamic prompts).
    pub fn dynamic_system_prompt(
        mut self,
        f: impl Fn(&AgentTask) -> String + Send + Sync + 'static,
    ) -> Self {
        self.system_prompt = SystemPrompt::Dynamic(Arc::new(f));
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn pre_processor(mut self, processor: Arc<dyn PreLlmProcessor>) -> Self {
        self.pre.push(processor);
        self
    }

    pub fn post_processor(mut self, processor: Arc<dyn PostLlmProcessor>) -> Self {
        self.post.push(processor);
        self
    }

    pub fn post_tool_processor(mut self, processor: Arc<dyn PostToolProcessor>) -> Self {
        self.post_tool.push(processor);
        self
    }

    pub fn max_iterations(mut self, cap: usize) -> Self {
        self.max_iterations = cap.max(1);
        self
    }

    pub fn max_parallel_tools(mut self, cap: usize) -> Self {
        self.max_parallel_tools = cap.max(1);
        self
    }

    /// Advertises the synthetic `execute_plan` tool to the model.
    pub fn enable_plan_execution(mut self) -> Self {
        self.plan_execution = true;
        self
    }

    pub fn memory(mut self, memory: Arc<Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn build(self) -> LlmAgent {
        LlmAgent {
            inner: Arc::new(Inner {
                name: self.name,
                description: self.description,
                provider: self.provider,
                system_prompt: self.system_prompt,
                tools: Arc::new(self.tools),
                pre: self.pre,
                post: self.post,
                post_tool: self.post_tool,
                max_iterations: self.max_iterations,
                max_parallel_tools: self.max_parallel_tools,
                plan_execution: self.plan_execution,
                memory: self.memory,
            }),
        }
    }
}

/// Single-LLM agent. Cheap to clone; clones share the same configuration.
#[derive(Clone)]
pub struct LlmAgent {
    inner: Arc<Inner>,
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>, provider: Arc<dyn Provider>) -> LlmAgentBuilder {
        LlmAgentBuilder {
            name: name.into(),
            description: String::new(),
            provider,
            system_prompt: SystemPrompt::None,
            tools: ToolRegistry::new(),
            pre: Vec::new(),
            post: Vec::new(),
            post_tool: Vec::new(),
            max_iterations: 10,
            max_parallel_tools: 10,
            plan_execution: false,
            memory: None,
        }
    }
}

struct Inner {
    name: String,
    description: String,
    provider: Arc<dyn Provider>,
    system_prompt: SystemPrompt,
    tools: Arc<ToolRegistry>,
    pre: Vec<Arc<dyn PreLlmProcessor>>,
    post: Vec<Arc<dyn PostLlmProcessor>>,
    post_tool: Vec<Arc<dyn PostToolProcessor>>,
    max_iterations: usize,
    max_parallel_tools: usize,
    plan_execution: bool,
    memory: Option<Arc<Memory>>,
}

/// Frozen loop state; moved into the continuation on suspension.
struct LoopState {
    messages: Vec<ChatMessage>,
    steps: Vec<StepTrace>,
    usage: TokenUsage,
    iteration: usize,
    last_output: String,
}

/// Where a (re-)entered loop picks up.
enum Entry {
    /// Start of an iteration.
    Fresh,
    /// Mid pre-LLM pipeline; `next` is the first processor still to run.
    PreLlm { next: usize },
    /// After tool dispatch; `suspended` is the call awaiting approval.
    PostDispatch {
        outcomes: Vec<DispatchOutcome>,
        suspended: usize,
    },
}

enum Flow {
    NextIteration,
    Halted { by: String, reason: String },
    Cancelled,
}

#[async_trait::async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn description(&self) -> &str {
        &self.inner.description
    }

    async fn execute(&self, ctx: &RunContext, task: AgentTask) -> Result<AgentResult, AgentError> {
        self.run(ctx, task, EventSink::noop()).await
    }

    async fn execute_stream(
        &self,
        ctx: &RunContext,
        task: AgentTask,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        self.run(ctx, task, sink).await
    }
}

impl LlmAgent {
    async fn run(
        &self,
        ctx: &RunContext,
        task: AgentTask,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        let span = info_span!("agent.execute", agent = %self.inner.name, run_id = %ctx.run_id);
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        async move {
            sink.emit(StreamEvent::InputReceived {
                input: task.input.clone(),
            })
            .await;

            let messages = inner.assemble(&task).await;
            let state = LoopState {
                messages,
                steps: Vec::new(),
                usage: TokenUsage::default(),
                iteration: 0,
                last_output: String::new(),
            };
            Inner::run_loop(inner, ctx, Arc::new(task), state, None, Entry::Fresh, sink).await
        }
        .instrument(span)
        .await
    }
}

impl Inner {
    /// System prompt + memory context + current input.
    async fn assemble(&self, task: &AgentTask) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(prompt) = self.system_prompt.render(task) {
            messages.push(ChatMessage::system(prompt));
        }
        if let Some(memory) = &self.memory {
            messages.extend(memory.context_messages(task).await);
        }
        messages.push(ChatMessage::user(task.input.clone()));
        messages
    }

    /// Tool catalog for the provider, including the synthetic plan tool.
    fn catalog(&self) -> Vec<ToolDefinition> {
        let mut defs = self.tools.definitions();
        if self.plan_execution && !defs.is_empty() {
            defs.push(plan_tool_definition());
        }
        defs
    }

    async fn run_loop(
        inner: Arc<Inner>,
        ctx: RunContext,
        task: Arc<AgentTask>,
        mut state: LoopState,
        mut resume_data: Option<Value>,
        entry: Entry,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        // Resume directly after tool dispatch when a HITL tool suspended.
        let mut pre_start = match entry {
            Entry::Fresh => 0,
            Entry::PreLlm { next } => next,
            Entry::PostDispatch {
                mut outcomes,
                suspended,
            } => {
                if let Some(data) = resume_data.take() {
                    let content = match &data {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    outcomes[suspended].result = ToolResult::ok(content);
                    outcomes[suspended].suspend = None;
                }
                match inner
                    .finish_dispatch(&ctx, &task, &mut state, outcomes, &sink)
                    .await
                {
                    Flow::Halted { by, reason } => {
                        return Ok(inner.finish(
                            &task,
                            state,
                            StopReason::Halted { by },
                            Some(reason),
                        ));
                    }
                    Flow::Cancelled => {
                        return Ok(inner.finish(&task, state, StopReason::Cancelled, None));
                    }
                    Flow::NextIteration => {
                        state.iteration += 1;
                        0
                    }
                }
            }
        };

        loop {
            if ctx.is_cancelled() {
                return Ok(inner.finish(&task, state, StopReason::Cancelled, None));
            }
            if state.iteration >= inner.max_iterations {
                debug!(agent = %inner.name, cap = inner.max_iterations, "iteration cap reached");
                return Ok(inner.finish(&task, state, StopReason::MaxIterations, None));
            }

            sink.emit(StreamEvent::ProcessingStart {
                agent: inner.name.clone(),
            })
            .await;

            // Pre-LLM processors, resuming mid-list after a suspension.
            for index in pre_start..inner.pre.len() {
                let processor = &inner.pre[index];
                let pctx = ProcessorContext {
                    task: &task,
                    resume_data: resume_data.as_ref(),
                };
                match processor.process(&pctx, &mut state.messages).await? {
                    Signal::Continue => {}
                    Signal::Halt(reason) => {
                        let by = processor.name().to_string();
                        return Ok(inner.finish(
                            &task,
                            state,
                            StopReason::Halted { by },
                            Some(reason),
                        ));
                    }
                    Signal::Suspend(payload) => {
                        // Resume re-enters this same processor with the
                        // approval data in its context.
                        return Ok(Inner::suspend(
                            inner,
                            task,
                            state,
                            payload,
                            Entry::PreLlm { next: index },
                        ));
                    }
                }
            }
            pre_start = 0;
            resume_data = None;

            // Provider call.
            let request = ChatRequest::new(state.messages.clone()).with_tools(inner.catalog());
            let started_at = Utc::now();
            let clock = Instant::now();
            let response = match inner.chat(&ctx, &request, &sink).await {
                Ok(response) => response,
                Err(AgentError::Cancelled) => {
                    return Ok(inner.finish(&task, state, StopReason::Cancelled, None));
                }
                Err(other) => return Err(other),
            };

            state.usage.add(response.usage);
            state.steps.push(
                StepTrace::ok(
                    format!("llm_call_{}", state.iteration + 1),
                    started_at,
                    clock.elapsed().as_millis() as u64,
                    json!({ "messages": request.messages.len() }),
                    json!({
                        "content": response.content,
                        "tool_calls": response.tool_calls.len(),
                    }),
                )
                .with_usage(response.usage),
            );
            if !response.content.is_empty() {
                state.last_output = response.content.clone();
            }

            if response.tool_calls.is_empty() {
                // Post-LLM processors on the final text.
                let mut output = response.content.clone();
                for processor in &inner.post {
                    let pctx = ProcessorContext {
                        task: &task,
                        resume_data: None,
                    };
                    match processor.process(&pctx, &response, &mut output).await? {
                        Signal::Continue => {}
                        Signal::Halt(reason) => {
                            let by = processor.name().to_string();
                            return Ok(inner.finish(
                                &task,
                                state,
                                StopReason::Halted { by },
                                Some(reason),
                            ));
                        }
                        Signal::Suspend(payload) => {
                            warn!(
                                processor = processor.name(),
                                "suspend from a post-LLM processor degrades to halt"
                            );
                            let by = processor.name().to_string();
                            return Ok(inner.finish(
                                &task,
                                state,
                                StopReason::Halted { by },
                                Some(payload.to_string()),
                            ));
                        }
                    }
                }
                return Ok(inner.finish(&task, state, StopReason::Completed, Some(output)));
            }

            // Tool phase: record the assistant turn, announce every call,
            // dispatch, then pair every start with a result.
            state.messages.push(ChatMessage::assistant_with_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                sink.emit(StreamEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                })
                .await;
            }

            let tool_ctx = ToolContext {
                thread_id: task.thread_id.clone(),
                user_id: task.user_id.clone(),
                from_sandbox: false,
                cancel: ctx.cancel.clone(),
            };
            let outcomes = inner
                .dispatch_calls(&tool_ctx, response.tool_calls.clone(), &sink)
                .await;

            if let Some(suspended) = outcomes.iter().position(|o| o.suspend.is_some()) {
                let payload = outcomes[suspended]
                    .suspend
                    .clone()
                    .unwrap_or(Value::Null);
                return Ok(Inner::suspend(
                    inner,
                    task,
                    state,
                    payload,
                    Entry::PostDispatch {
                        outcomes,
                        suspended,
                    },
                ));
            }

            match inner
                .finish_dispatch(&ctx, &task, &mut state, outcomes, &sink)
                .await
            {
                Flow::Halted { by, reason } => {
                    return Ok(inner.finish(&task, state, StopReason::Halted { by }, Some(reason)));
                }
                Flow::Cancelled => {
                    return Ok(inner.finish(&task, state, StopReason::Cancelled, None));
                }
                Flow::NextIteration => state.iteration += 1,
            }
        }
    }

    /// Provider call with cancellation and (when streaming) delta
    /// forwarding. The forwarder worker is joined before returning.
    async fn chat(
        &self,
        ctx: &RunContext,
        request: &ChatRequest,
        sink: &EventSink,
    ) -> Result<ChatResponse, AgentError> {
        if !sink.is_enabled() {
            return tokio::select! {
                _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
                result = self.provider.chat(request) => result.map_err(AgentError::from),
            };
        }

        let (tx, mut rx) = mpsc::channel::<ProviderDelta>(32);
        let forward_sink = sink.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                let event = match delta {
                    ProviderDelta::Text { content } => StreamEvent::TextDelta { content },
                    ProviderDelta::Thinking { content } => StreamEvent::Thinking { content },
                    ProviderDelta::ToolCall {
                        id,
                        name,
                        arguments_delta,
                    } => StreamEvent::ToolCallDelta {
                        id: id.unwrap_or_default(),
                        name,
                        arguments_delta,
                    },
                };
                forward_sink.emit(event).await;
            }
        });

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.provider.chat_stream(request, tx) => result.map_err(AgentError::from),
        };
        // The provider dropped its sender (or the select dropped the call
        // future); the forwarder drains and exits.
        let _ = forwarder.await;
        result
    }

    /// Dispatches one response's calls, intercepting `execute_plan`.
    async fn dispatch_calls(
        &self,
        tool_ctx: &ToolContext,
        calls: Vec<ToolCall>,
        sink: &EventSink,
    ) -> Vec<DispatchOutcome> {
        let has_plan = self.plan_execution
            && calls.iter().any(|c| c.name == TOOL_EXECUTE_PLAN);
        if !has_plan {
            return dispatch_parallel(
                Arc::clone(&self.tools),
                tool_ctx,
                calls,
                self.max_parallel_tools,
                sink,
            )
            .await;
        }

        let mut slots: Vec<Option<DispatchOutcome>> = Vec::new();
        slots.resize_with(calls.len(), || None);
        let mut batch: Vec<(usize, ToolCall)> = Vec::new();
        for (index, call) in calls.into_iter().enumerate() {
            if call.name == TOOL_EXECUTE_PLAN {
                let started = Instant::now();
                let result = run_plan(
                    Arc::clone(&self.tools),
                    tool_ctx,
                    call.args.clone(),
                    self.max_parallel_tools,
                    sink,
                )
                .await;
                slots[index] = Some(DispatchOutcome {
                    call,
                    result,
                    suspend: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            } else {
                batch.push((index, call));
            }
        }

        let indices: Vec<usize> = batch.iter().map(|(i, _)| *i).collect();
        let outcomes = dispatch_parallel(
            Arc::clone(&self.tools),
            tool_ctx,
            batch.into_iter().map(|(_, c)| c).collect(),
            self.max_parallel_tools,
            sink,
        )
        .await;
        for (slot, outcome) in indices.into_iter().zip(outcomes) {
            slots[slot] = Some(outcome);
        }
        slots.into_iter().flatten().collect()
    }

    /// Emits results, appends tool messages in call order, runs post-tool
    /// processors (redactions flow back into the appended message).
    async fn finish_dispatch(
        &self,
        ctx: &RunContext,
        task: &AgentTask,
        state: &mut LoopState,
        mut outcomes: Vec<DispatchOutcome>,
        sink: &EventSink,
    ) -> Flow {
        let base_index = state.messages.len();
        for outcome in &outcomes {
            sink.emit(StreamEvent::ToolCallResult {
                id: outcome.call.id.clone(),
                name: outcome.call.name.clone(),
                content: outcome.result.content.clone(),
                error: outcome.result.error.clone(),
                duration_ms: outcome.duration_ms,
            })
            .await;
            state
                .messages
                .push(ChatMessage::tool(&outcome.call.id, outcome.result.history_text()));
            state.steps.push(match &outcome.result.error {
                None => StepTrace::ok(
                    outcome.call.name.clone(),
                    Utc::now(),
                    outcome.duration_ms,
                    outcome.call.args.clone(),
                    Value::String(outcome.result.content.clone()),
                ),
                Some(error) => StepTrace::failed(
                    outcome.call.name.clone(),
                    Utc::now(),
                    outcome.duration_ms,
                    outcome.call.args.clone(),
                    error.clone(),
                ),
            });
        }

        // Post-tool processors in registration order, per result.
        for (offset, outcome) in outcomes.iter_mut().enumerate() {
            for processor in &self.post_tool {
                let pctx = ProcessorContext {
                    task,
                    resume_data: None,
                };
                let signal = match processor
                    .process(&pctx, &outcome.call.name, &outcome.call.args, &mut outcome.result)
                    .await
                {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!(processor = processor.name(), error = %e, "post-tool processor failed");
                        continue;
                    }
                };
                state.messages[base_index + offset] =
                    ChatMessage::tool(&outcome.call.id, outcome.result.history_text());
                match signal {
                    Signal::Continue => {}
                    Signal::Halt(reason) => {
                        return Flow::Halted {
                            by: processor.name().to_string(),
                            reason,
                        };
                    }
                    Signal::Suspend(payload) => {
                        warn!(
                            processor = processor.name(),
                            "suspend from a post-tool processor degrades to halt"
                        );
                        return Flow::Halted {
                            by: processor.name().to_string(),
                            reason: payload.to_string(),
                        };
                    }
                }
            }
        }

        if ctx.is_cancelled() {
            return Flow::Cancelled;
        }
        Flow::NextIteration
    }

    /// Builds the final result and, for completed turns, records memory
    /// from a detached task.
    fn finish(
        &self,
        task: &AgentTask,
        state: LoopState,
        stop: StopReason,
        output: Option<String>,
    ) -> AgentResult {
        let output = output.unwrap_or_else(|| match &stop {
            StopReason::Cancelled => "execution cancelled".to_string(),
            _ => state.last_output.clone(),
        });

        let record = matches!(
            stop,
            StopReason::Completed | StopReason::Halted { .. } | StopReason::MaxIterations
        );
        if record {
            if let Some(memory) = &self.memory {
                // Fire-and-forget: the write survives caller cancellation.
                let _ = memory.record_turn(task, output.clone(), state.steps.clone());
            }
        }

        AgentResult {
            output,
            usage: state.usage,
            steps: state.steps,
            stop,
            suspension: None,
        }
    }

    /// Packages the frozen loop state into a resumable marker.
    fn suspend(
        inner: Arc<Inner>,
        task: Arc<AgentTask>,
        state: LoopState,
        payload: Value,
        at: Entry,
    ) -> AgentResult {
        let usage = state.usage;
        let steps = state.steps.clone();
        let suspension = Suspension::new(payload, move |data, sink| {
            // A resumed run gets a fresh cancellation handle; the
            // original caller's context ended with the suspension.
            let ctx = RunContext::new();
            Box::pin(Inner::run_loop(
                inner,
                ctx,
                task,
                state,
                Some(data),
                at,
                sink,
            ))
        });
        AgentResult {
            output: String::new(),
            usage,
            steps,
            stop: StopReason::Suspended,
            suspension: Some(suspension),
        }
    }
}
