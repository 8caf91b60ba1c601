//! Network: a router provider in front of a set of sub-agents.
//!
//! One routing call picks the sub-agents for the turn; the chosen agents
//! run concurrently on the same sink, and their outputs are combined by a
//! reducer. A sub-agent's failure surfaces in its `agent_finish` event and
//! its slot of the combined output; siblings keep running.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};

use crate::agent::{Agent, AgentResult, AgentTask, RunContext, StepTrace, StopReason};
use crate::error::AgentError;
use crate::event::EventSink;
use crate::message::{ChatMessage, ChatRequest};
use crate::provider::Provider;
use stream_event::{StreamEvent, TokenUsage};

/// Combines per-agent outputs (name, output-or-error-text) into the
/// network's final output.
pub type Reducer = Arc<dyn Fn(&[(String, String)]) -> String + Send + Sync>;

/// The router's parsed reply.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RoutingDecision {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Builder for [`Network`].
pub struct NetworkBuilder {
    name: String,
    description: String,
    router: Arc<dyn Provider>,
    agents: Vec<Arc<dyn Agent>>,
    reducer: Reducer,
}

impl NetworkBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn reducer(mut self, reducer: impl Fn(&[(String, String)]) -> String + Send + Sync + 'static) -> Self {
        self.reducer = Arc::new(reducer);
        self
    }

    pub fn build(self) -> Network {
        Network {
            name: self.name,
            description: self.description,
            router: self.router,
            agents: self.agents,
            reducer: self.reducer,
        }
    }
}

/// Router network over sub-agents.
pub struct Network {
    name: String,
    description: String,
    router: Arc<dyn Provider>,
    agents: Vec<Arc<dyn Agent>>,
    reducer: Reducer,
}

impl Network {
    pub fn builder(name: impl Into<String>, router: Arc<dyn Provider>) -> NetworkBuilder {
        NetworkBuilder {
            name: name.into(),
            description: String::new(),
            router,
            agents: Vec::new(),
            reducer: Arc::new(default_reducer),
        }
    }

    fn routing_prompt(&self, task: &AgentTask) -> ChatRequest {
        let mut listing = String::new();
        for agent in &self.agents {
            listing.push_str(&format!("- {}: {}\n", agent.name(), agent.description()));
        }
        let system = format!(
            "You route requests to specialist agents. Available agents:\n{}\n\
             Reply with JSON only: {{\"agents\": [\"name\", ...], \"tools\": []}}. \
             Pick every agent the request needs, at least one.",
            listing
        );
        ChatRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(task.input.clone()),
        ])
        .with_response_schema(json!({
            "type": "object",
            "properties": {
                "agents": { "type": "array", "items": { "type": "string" } },
                "tools": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["agents"]
        }))
    }

    /// Parses the router's reply; on garbage the first sub-agent is the
    /// fallback route.
    fn parse_decision(&self, reply: &str) -> RoutingDecision {
        let body = crate::memory::strip_code_fence(reply);
        match serde_json::from_str::<RoutingDecision>(body) {
            Ok(decision) if !decision.agents.is_empty() => decision,
            _ => {
                warn!(network = %self.name, "unparseable routing reply, falling back to first agent");
                RoutingDecision {
                    agents: self
                        .agents
                        .first()
                        .map(|a| vec![a.name().to_string()])
                        .unwrap_or_default(),
                    tools: Vec::new(),
                }
            }
        }
    }

    async fn run(
        &self,
        ctx: &RunContext,
        task: AgentTask,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        if self.agents.is_empty() {
            return Err(AgentError::Config(format!(
                "network '{}' has no sub-agents",
                self.name
            )));
        }

        sink.emit(StreamEvent::InputReceived {
            input: task.input.clone(),
        })
        .await;

        // Routing call.
        let request = self.routing_prompt(&task);
        let started_at = Utc::now();
        let clock = Instant::now();
        let reply = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Ok(AgentResult {
                    output: "execution cancelled".into(),
                    stop: StopReason::Cancelled,
                    ..Default::default()
                });
            }
            reply = self.router.chat(&request) => reply?,
        };
        let decision = self.parse_decision(&reply.content);

        let mut usage = reply.usage;
        let mut steps = vec![StepTrace::ok(
            "route",
            started_at,
            clock.elapsed().as_millis() as u64,
            json!({ "input": task.input }),
            json!({ "agents": decision.agents, "raw": reply.content }),
        )
        .with_usage(reply.usage)];

        sink.emit(StreamEvent::RoutingDecision {
            agents: decision.agents.clone(),
            tools: decision.tools.clone(),
        })
        .await;

        // Resolve chosen agents, preserving decision order and dropping
        // names the router invented.
        let chosen: Vec<Arc<dyn Agent>> = decision
            .agents
            .iter()
            .filter_map(|name| {
                let found = self.agents.iter().find(|a| a.name() == name).cloned();
                if found.is_none() {
                    warn!(network = %self.name, agent = %name, "router picked unknown agent");
                }
                found
            })
            .collect();
        let chosen = if chosen.is_empty() {
            vec![Arc::clone(&self.agents[0])]
        } else {
            chosen
        };

        debug!(network = %self.name, agents = chosen.len(), "dispatching to sub-agents");

        // Delegate concurrently; each sub-agent streams onto the same sink.
        let dispatches = chosen.iter().map(|agent| {
            let agent = Arc::clone(agent);
            let sink = sink.clone();
            let ctx = ctx.child();
            let task = AgentTask {
                input: task.input.clone(),
                thread_id: task.thread_id.clone(),
                user_id: task.user_id.clone(),
                context: task.context.clone(),
            };
            let span = info_span!("network.dispatch", network = %self.name, agent = %agent.name());
            async move {
                let name = agent.name().to_string();
                sink.emit(StreamEvent::AgentStart { name: name.clone() }).await;
                let started = Instant::now();
                let result = agent.execute_stream(&ctx, task, sink.clone()).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(result) => {
                        sink.emit(StreamEvent::AgentFinish {
                            name: name.clone(),
                            output: result.output.clone(),
                            error: None,
                            usage: result.usage,
                            duration_ms,
                        })
                        .await;
                        (name, Ok(result), duration_ms)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        sink.emit(StreamEvent::AgentFinish {
                            name: name.clone(),
                            output: String::new(),
                            error: Some(message.clone()),
                            usage: TokenUsage::default(),
                            duration_ms,
                        })
                        .await;
                        (name, Err(message), duration_ms)
                    }
                }
            }
            .instrument(span)
        });
        let finished = join_all(dispatches).await;

        // Combine in decision order.
        let mut combined: Vec<(String, String)> = Vec::with_capacity(finished.len());
        for (name, outcome, duration_ms) in finished {
            match outcome {
                Ok(result) => {
                    usage.add(result.usage);
                    steps.push(
                        StepTrace::ok(
                            format!("agent:{}", name),
                            Utc::now(),
                            duration_ms,
                            json!({ "input": task.input }),
                            json!({ "output": result.output }),
                        )
                        .with_usage(result.usage),
                    );
                    steps.extend(result.steps);
                    combined.push((name, result.output));
                }
                Err(message) => {
                    steps.push(StepTrace::failed(
                        format!("agent:{}", name),
                        Utc::now(),
                        duration_ms,
                        json!({ "input": task.input }),
                        message.clone(),
                    ));
                    combined.push((name, format!("[error: {}]", message)));
                }
            }
        }

        let output = (self.reducer)(&combined);
        let stop = if ctx.is_cancelled() {
            StopReason::Cancelled
        } else {
            StopReason::Completed
        };
        Ok(AgentResult {
            output,
            usage,
            steps,
            stop,
            suspension: None,
        })
    }
}

fn default_reducer(outputs: &[(String, String)]) -> String {
    if outputs.len() == 1 {
        return outputs[0].1.clone();
    }
    outputs
        .iter()
        .map(|(name, output)| format!("[{}]\n{}", name, output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait::async_trait]
impl Agent for Network {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
