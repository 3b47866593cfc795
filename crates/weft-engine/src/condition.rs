use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use weft_core::definition::WorkflowStep;
use weft_core::types::{StepStatus, WorkflowExecution};

/// Values visible to condition expressions.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    data: HashMap<String, Value>,
}

impl ConditionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the context for `step`: the execution input, the step's own
    /// input, and every finished step's output plus its `<id>_status`.
    pub fn for_step(execution: &WorkflowExecution, step: &WorkflowStep) -> Self {
        let mut ctx = Self::new();
        ctx.set("input", execution.input.clone());
        if let Some(obj) = execution.input.as_object() {
            for (k, v) in obj {
                ctx.set(k.clone(), v.clone());
            }
        }
        for (k, v) in &step.input {
            ctx.set(k.clone(), v.clone());
        }
        for (step_id, exec) in execution.step_outputs() {
            ctx.set(step_id, exec.output.clone());
            let status = if exec.status == StepStatus::Completed {
                "success"
            } else {
                "failure"
            };
            ctx.set(format!("{}_status", step_id), Value::String(status.into()));
        }
        ctx
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Resolve `key`, walking nested objects for dotted keys (`step.field`).
    pub fn resolve(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.data.get(key) {
            return Some(v);
        }
        let mut parts = key.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Evaluate a condition expression against `ctx`.
///
/// Supported expressions:
/// - `true` / `false`
/// - `key == "value"` / `key != "value"`
/// - `key contains "substr"`
/// - `key exists`
/// - `!<expr>`
///
/// Unparseable expressions evaluate to `false`.
pub fn evaluate_condition(expr: &str, ctx: &ConditionContext) -> bool {
    match evaluate(expr.trim(), ctx) {
        Some(result) => result,
        None => {
            warn!(expr, "Unparseable condition, treating as false");
            false
        }
    }
}

fn evaluate(expr: &str, ctx: &ConditionContext) -> Option<bool> {
    if let Some(rest) = expr.strip_prefix('!') {
        if !rest.starts_with('=') {
            return evaluate(rest.trim(), ctx).map(|b| !b);
        }
    }

    match expr {
        "true" => return Some(true),
        "false" => return Some(false),
        _ => {}
    }

    if let Some(key) = expr.strip_suffix(" exists") {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        return Some(ctx.resolve(key).is_some_and(|v| !v.is_null()));
    }

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return Some(ctx.resolve(key).is_some_and(|v| match v {
            Value::String(s) => s.contains(substr),
            Value::Array(items) => items.iter().any(|item| scalar_text(item) == substr),
            _ => false,
        }));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return Some(ctx.resolve(key).is_some_and(|v| scalar_text(v) != value));
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return Some(ctx.resolve(key).is_some_and(|v| scalar_text(v) == value));
    }

    None
}

/// Strings compare by content; other values by their JSON text.
fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    if key.is_empty() {
        return None;
    }
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}
