//! Plan execution: the synthetic `execute_plan` tool.
//!
//! The model batches several tool calls into one turn by invoking
//! `execute_plan` with an ordered list of steps. The runtime executes the
//! plan as a micro-DAG: steps with satisfied dependencies run
//! concurrently, and `{{step.output}}` templates in child arguments are
//! substituted with parent results. The combined result — a JSON map of
//! step name to result text — returns to the model as one tool result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::event::EventSink;
use crate::tool::{ToolContext, ToolDefinition, ToolRegistry, ToolResult};

use super::dispatch::dispatch_parallel;
use crate::message::ToolCall;

/// Name under which the plan tool is advertised.
pub const TOOL_EXECUTE_PLAN: &str = "execute_plan";

/// One step of a plan as sent by the model.
#[derive(Clone, Debug, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The definition advertised to the model when plan execution is enabled.
pub fn plan_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        TOOL_EXECUTE_PLAN,
        "Execute several tool calls as one plan. Steps run in parallel unless \
         linked by depends_on; reference a dependency's result in args with \
         {{step_name.output}}.",
        json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string", "description": "Unique step name." },
                            "tool": { "type": "string", "description": "Tool to call." },
                            "args": { "type": "object", "description": "Arguments; may contain {{step.output}} templates." },
                            "depends_on": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Steps that must finish first."
                            }
                        },
                        "required": ["name", "tool"]
                    },
                    "minItems": 1
                }
            },
            "required": ["steps"]
        }),
    )
}

/// Parses and runs a plan. Validation failures come back as the tool
/// result's error, like any other bad tool input.
pub async fn run_plan(
    registry: Arc<ToolRegistry>,
    ctx: &ToolContext,
    args: Value,
    max_parallel: usize,
    sink: &EventSink,
) -> ToolResult {
    let steps: Vec<PlanStep> = match args.get("steps") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(steps) => steps,
            Err(e) => return ToolResult::error(format!("invalid plan: {}", e)),
        },
        None => return ToolResult::error("invalid plan: missing 'steps'"),
    };
    if steps.is_empty() {
        return ToolResult::error("invalid plan: empty step list");
    }

    if let Err(message) = validate(&steps) {
        return ToolResult::error(message);
    }

    let mut remaining: Vec<PlanStep> = steps;
    let mut results: HashMap<String, String> = HashMap::new();
    let order: Vec<String> = remaining.iter().map(|s| s.name.clone()).collect();

    while !remaining.is_empty() {
        let (ready, rest): (Vec<PlanStep>, Vec<PlanStep>) = remaining
            .into_iter()
            .partition(|s| s.depends_on.iter().all(|d| results.contains_key(d)));
        remaining = rest;
        // validate() rejected cycles, so progress is guaranteed.
        debug_assert!(!ready.is_empty());

        let calls: Vec<ToolCall> = ready
            .iter()
            .map(|step| ToolCall {
                id: format!("plan:{}", step.name),
                name: step.tool.clone(),
                args: substitute(&step.args, &results),
            })
            .collect();
        debug!(batch = calls.len(), "running plan wave");

        let outcomes =
            dispatch_parallel(Arc::clone(&registry), ctx, calls, max_parallel, sink).await;
        for (step, outcome) in ready.iter().zip(outcomes) {
            results.insert(step.name.clone(), outcome.result.history_text());
        }

        if ctx.cancel.is_cancelled() {
            return ToolResult::error("plan execution cancelled");
        }
    }

    let mut combined = Map::new();
    for name in order {
        let text = results.remove(&name).unwrap_or_default();
        combined.insert(name, Value::String(text));
    }
    match serde_json::to_string(&Value::Object(combined)) {
        Ok(rendered) => ToolResult::ok(rendered),
        Err(e) => ToolResult::error(format!("plan result serialization: {}", e)),
    }
}

/// Rejects duplicate names, unknown dependencies, self-references, and
/// cycles (via Kahn's algorithm over the dependency edges).
fn validate(steps: &[PlanStep]) -> Result<(), String> {
    let mut names = HashSet::new();
    for step in steps {
        if !names.insert(step.name.as_str()) {
            return Err(format!("invalid plan: duplicate step '{}'", step.name));
        }
    }
    for step in steps {
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(format!("invalid plan: step '{}' depends on itself", step.name));
            }
            if !names.contains(dep.as_str()) {
                return Err(format!(
                    "invalid plan: step '{}' depends on unknown step '{}'",
                    step.name, dep
                ));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        steps.iter().map(|s| (s.name.as_str(), s.depends_on.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.name.as_str());
        }
    }
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut visited = 0;
    while let Some(name) = queue.pop() {
        visited += 1;
        for &child in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            let d = in_degree.get_mut(child).expect("validated name");
            *d -= 1;
            if *d == 0 {
                queue.push(child);
            }
        }
    }
    if visited != steps.len() {
        return Err("invalid plan: dependency cycle".to_string());
    }
    Ok(())
}

/// Replaces `{{step.output}}` placeholders inside string values, walking
/// nested objects and arrays.
fn substitute(args: &Value, results: &HashMap<String, String>) -> Value {
    match args {
        Value::String(s) => {
            let mut out = s.clone();
            for (name, text) in results {
                let placeholder = format!("{{{{{}.output}}}}", name);
                if out.contains(&placeholder) {
                    out = out.replace(&placeholder, text);
                }
            }
            Value::String(out)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, results)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, results)).collect()),
        other => other.clone(),
    }
}
