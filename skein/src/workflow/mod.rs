//! Workflow: a declarative DAG of steps under the `Agent` contract.
//!
//! Steps are inline async functions, nested agents, or `for_each` fan-outs
//! over a collection. Dependencies are declared by name (`after`), input
//! wiring by reference (`input_from("step.output")`). The executor runs
//! every ready step in parallel under a concurrency cap, scheduling the
//! longest remaining path first.

mod executor;
mod graph;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::agent::{Agent, AgentResult, AgentTask, RunContext};
use crate::error::{AgentError, WorkflowBuildError};
use crate::event::EventSink;

/// Input handed to a function step.
#[derive(Clone, Debug)]
pub struct StepInput {
    /// Resolved `input_from` value; the task input for root steps, or the
    /// current item inside a `for_each`.
    pub input: Value,
    /// Snapshot of every finished step's output, keyed by step name.
    pub outputs: HashMap<String, Value>,
}

/// Boxed async function step body.
pub type StepFn =
    Arc<dyn Fn(StepInput) -> BoxFuture<'static, Result<Value, AgentError>> + Send + Sync>;

/// Body of a `for_each` element.
#[derive(Clone)]
pub enum StepBody {
    Func(StepFn),
    Agent(Arc<dyn Agent>),
}

/// Where a `for_each` gets its items.
#[derive(Clone)]
pub enum ItemsSource {
    /// A literal collection.
    Literal(Vec<Value>),
    /// A reference like `"step.output"`; must resolve to a JSON array.
    From(String),
}

/// What a step does.
#[derive(Clone)]
pub enum StepKind {
    Func(StepFn),
    Agent(Arc<dyn Agent>),
    ForEach { items: ItemsSource, body: StepBody },
}

/// Per-step failure policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Cancel everything still pending or running.
    FailFast,
    /// Record the error; dependents that don't consume this step's output
    /// still run, consumers are skipped.
    Continue,
    /// Retry up to `attempts` extra times with doubling backoff, then
    /// apply `FailFast`.
    Retry { attempts: u32, backoff: Duration },
}

/// One workflow step.
#[derive(Clone)]
pub struct Step {
    pub(crate) name: String,
    pub(crate) kind: StepKind,
    pub(crate) after: Vec<String>,
    pub(crate) input_from: Option<String>,
    pub(crate) on_error: ErrorPolicy,
}

impl Step {
    /// Inline async function step.
    pub fn func<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Func(Arc::new(move |input| Box::pin(f(input)))),
            after: Vec::new(),
            input_from: None,
            on_error: ErrorPolicy::FailFast,
        }
    }

    /// Nested agent step: the resolved input becomes the agent's task.
    pub fn agent(name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Agent(agent),
            after: Vec::new(),
            input_from: None,
            on_error: ErrorPolicy::FailFast,
        }
    }

    /// Fan-out over a collection; `body` runs once per item.
    pub fn for_each(name: impl Into<String>, items: ItemsSource, body: StepBody) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::ForEach { items, body },
            after: Vec::new(),
            input_from: None,
            on_error: ErrorPolicy::FailFast,
        }
    }

    /// Declares a dependency: this step starts only after `step` finished.
    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.after.push(step.into());
        self
    }

    /// Wires this step's input from a prior step: `"step.output"` (deeper
    /// paths like `"step.output.field"` walk into the value).
    pub fn input_from(mut self, reference: impl Into<String>) -> Self {
        self.input_from = Some(reference.into());
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Step names this step reads output from (wiring references).
    pub(crate) fn input_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        if let Some(r) = &self.input_from {
            refs.push(ref_step_name(r));
        }
        if let StepKind::ForEach {
            items: ItemsSource::From(r),
            ..
        } = &self.kind
        {
            refs.push(ref_step_name(r));
        }
        refs
    }
}

/// The step-name part of a `"step.output[...]"` reference.
pub(crate) fn ref_step_name(reference: &str) -> &str {
    reference.split('.').next().unwrap_or(reference)
}

/// Resolves `"step.output"` (or `"step.output.path.to.field"`) against the
/// outputs map.
pub(crate) fn resolve_ref(reference: &str, outputs: &HashMap<String, Value>) -> Option<Value> {
    let mut parts = reference.split('.');
    let step = parts.next()?;
    let mut value = outputs.get(step)?.clone();
    match parts.next() {
        Some("output") | None => {}
        Some(_) => return None,
    }
    for key in parts {
        value = value.get(key)?.clone();
    }
    Some(value)
}

/// Builder validating the graph before execution.
pub struct WorkflowBuilder {
    name: String,
    description: String,
    steps: Vec<Step>,
    concurrency: usize,
}

impl WorkflowBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Workflow-level cap on concurrently running steps (default 8).
    pub fn concurrency(mut self, cap: usize) -> Self {
        self.concurrency = cap.max(1);
        self
    }

    /// Validates names, references, and acyclicity.
    pub fn build(self) -> Result<Workflow, WorkflowBuildError> {
        if self.steps.is_empty() {
            return Err(WorkflowBuildError::Empty);
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.clone()) {
                return Err(WorkflowBuildError::DuplicateStep(step.name.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.after {
                if !names.contains(dep) {
                    return Err(WorkflowBuildError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for reference in step.input_refs() {
                if !names.contains(reference) {
                    return Err(WorkflowBuildError::UnknownInput {
                        step: step.name.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        let step_names: Vec<String> = self.steps.iter().map(|s| s.name.clone()).collect();
        let edges = workflow_edges(&self.steps);
        if graph::topological_order(&step_names, &edges).is_none() {
            return Err(WorkflowBuildError::Cycle);
        }
        let ranks = graph::longest_path_ranks(&step_names, &edges);

        Ok(Workflow {
            name: self.name,
            description: self.description,
            steps: self.steps.into_iter().map(Arc::new).collect(),
            concurrency: self.concurrency,
            ranks,
        })
    }
}

/// All scheduling edges: explicit `after` plus implicit wiring references.
pub(crate) fn workflow_edges(steps: &[Step]) -> Vec<(String, String)> {
    let mut edges = Vec::new();
    for step in steps {
        for dep in &step.after {
            edges.push((dep.clone(), step.name.clone()));
        }
        for reference in step.input_refs() {
            let edge = (reference.to_string(), step.name.clone());
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
    }
    edges
}

/// Declarative DAG workflow.
pub struct Workflow {
    name: String,
    description: String,
    steps: Vec<Arc<Step>>,
    concurrency: usize,
    ranks: HashMap<String, usize>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            concurrency: 8,
        }
    }
}

#[async_trait::async_trait]
impl Agent for Workflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, ctx: &RunContext, task: AgentTask) -> Result<AgentResult, AgentError> {
        executor::run(self, ctx, task, EventSink::noop()).await
    }

    async fn execute_stream(
        &self,
        ctx: &RunContext,
        task: AgentTask,
        sink: EventSink,
    ) -> Result<AgentResult, AgentError> {
        executor::run(self, ctx, task, sink).await
    }
}
