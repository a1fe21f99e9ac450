pub mod workflow;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::scheduler::Scheduler;

pub use workflow::WorkflowTool;

/// A JSON-driven entry point into the scheduler.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Schema checked by [`ToolRegistry::execute`] before `execute` runs.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value) -> Result<String>;
}

/// Named tools, each called with one JSON action object.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry holding the workflow tool bound to `scheduler`.
    pub fn for_scheduler(scheduler: Scheduler) -> Self {
        let mut registry = Self::default();
        registry.register(Box::new(WorkflowTool::new(scheduler)));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Check `params` against the tool's schema, then run it.
    ///
    /// Invalid parameters come back as an `Error (invalid_params): ...`
    /// reply, the same shape the workflow tool uses for rejected calls.
    /// Only an unknown tool name is an `Err`.
    pub async fn execute(&self, name: &str, params: Value) -> Result<String> {
        let Some(tool) = self.tools.get(name) else {
            anyhow::bail!(
                "unknown tool '{name}' (available: {})",
                self.names().join(", ")
            );
        };
        let problems = check_params(&params, &tool.parameters_schema());
        if !problems.is_empty() {
            return Ok(format!("Error (invalid_params): {}", problems.join("; ")));
        }
        tool.execute(params).await
    }
}

/// Check `params` against the schema keywords tool schemas use: `type`,
/// `enum`, `minLength`, `required`, `properties` and `items`.
/// Returns one message per violation, empty when the params fit.
pub fn check_params(params: &Value, schema: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    check(params, schema, "params", &mut problems);
    problems
}

fn check(value: &Value, schema: &Value, at: &str, problems: &mut Vec<String>) {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !has_type(value, expected) {
            problems.push(format!("{at}: expected {expected}, got {}", type_name(value)));
            return;
        }
    }
    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let choices: Vec<String> = allowed.iter().map(Value::to_string).collect();
            problems.push(format!("{at}: {value} is not one of {}", choices.join(", ")));
        }
    }

    match value {
        Value::String(s) => {
            let min = schema.get("minLength").and_then(Value::as_u64);
            if let Some(min) = min.filter(|&min| (s.chars().count() as u64) < min) {
                problems.push(format!("{at}: shorter than {min} character(s)"));
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item, item_schema, &format!("{at}[{i}]"), problems);
                }
            }
        }
        Value::Object(fields) => {
            let required = schema.get("required").and_then(Value::as_array);
            for key in required.into_iter().flatten().filter_map(Value::as_str) {
                if !fields.contains_key(key) {
                    problems.push(format!("{at}: missing '{key}'"));
                }
            }
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, field) in fields {
                    if let Some(prop) = props.get(key) {
                        check(field, prop, &format!("{at}.{key}"), problems);
                    }
                }
            }
        }
        _ => {}
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "number" => value.is_number(),
        other => type_name(value) == other,
    }
}
