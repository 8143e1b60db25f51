/// Built-in control-flow node handlers
///
/// These nodes have no external side effects; they only shape the path a run
/// takes through the graph. Integrations (email, chat, AI, CRM) register their
/// own handlers next to these.

use crate::runtime::{
    expression::{evaluate_condition, evaluate_expression, is_truthy},
    graph::case_handle,
    registry::{NodeHandler, NodeInvocation, NodeRegistry},
    context::stringify,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Trigger node types that simply hand the trigger payload to the graph
pub const TRIGGER_NODE_TYPES: [&str; 4] = ["manual_trigger", "webhook_trigger", "schedule_trigger", "cron_trigger"];

/// Register every built-in handler on `registry`
pub fn register_builtins(registry: &NodeRegistry) {
    let trigger: Arc<dyn NodeHandler> = Arc::new(TriggerNode);
    for node_type in TRIGGER_NODE_TYPES {
        registry.register_arc(node_type, Arc::clone(&trigger));
    }

    registry.register("if_else", IfElseNode);
    registry.register("switch", SwitchNode);
    registry.register("set_variable", SetVariableNode);
    registry.register("delay", DelayNode);
    registry.register("stop", StopNode);
}

/// Entry node: outputs the run's trigger data
pub struct TriggerNode;

#[async_trait]
impl NodeHandler for TriggerNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        Ok(invocation.run.trigger_data.clone())
    }
}

/// Two-way branch on a boolean expression
///
/// The expression is read from the unresolved config so that `{{path}}`
/// placeholders are resolved as values by the evaluator, never spliced into
/// the expression text.
pub struct IfElseNode;

#[async_trait]
impl NodeHandler for IfElseNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        let result = match invocation.raw_config().get("condition") {
            Some(Value::String(expression)) => evaluate_condition(expression, invocation.context)?,
            Some(_) => invocation.config.get("condition").map(is_truthy).unwrap_or(false),
            None => return Err(anyhow!("if_else node '{}' has no condition", invocation.node_id())),
        };

        Ok(json!({
            "result": result,
            "branch": if result { "true" } else { "false" },
        }))
    }
}

/// Multi-way branch: evaluates `value` and follows the first matching case
pub struct SwitchNode;

#[async_trait]
impl NodeHandler for SwitchNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        let value = match invocation.raw_config().get("value") {
            Some(Value::String(expression)) => evaluate_expression(expression, invocation.context)?,
            Some(_) => invocation.config.get("value").cloned().unwrap_or(Value::Null),
            None => return Err(anyhow!("switch node '{}' has no value", invocation.node_id())),
        };

        let needle = stringify(&value);
        let branch = invocation
            .raw_config()
            .get("cases")
            .and_then(Value::as_array)
            .and_then(|cases| {
                cases.iter().find_map(|case| {
                    let matches = match case {
                        Value::Object(fields) => fields.get("value").map(stringify).or_else(|| case_handle(case)),
                        other => case_handle(other),
                    };
                    (matches.as_deref() == Some(needle.as_str())).then(|| case_handle(case)).flatten()
                })
            })
            .unwrap_or_else(|| "default".to_string());

        Ok(json!({ "value": value, "branch": branch }))
    }
}

/// Assigns a named variable, exposed to later expressions as a bare identifier
pub struct SetVariableNode;

#[async_trait]
impl NodeHandler for SetVariableNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        let name = invocation
            .config
            .get("variable")
            .or_else(|| invocation.config.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("set_variable node '{}' has no variable name", invocation.node_id()))?;

        let value = match invocation.raw_config().get("expression") {
            Some(Value::String(expression)) => evaluate_expression(expression, invocation.context)?,
            _ => invocation.config.get("value").cloned().unwrap_or(Value::Null),
        };

        Ok(json!({ "variable": name, "value": value }))
    }
}

/// Suspends the run until a point in time
///
/// Accepts `duration_ms`, `{amount, unit}` or an absolute RFC 3339 `until`.
/// An optional `next_node_id` overrides the successor to resume at.
pub struct DelayNode;

#[async_trait]
impl NodeHandler for DelayNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        let resume_at = delay_until(&invocation.config, Utc::now())
            .map_err(|e| anyhow!("delay node '{}': {}", invocation.node_id(), e))?;

        let mut output = json!({
            "action": "wait",
            "resumeAt": resume_at.to_rfc3339(),
        });
        if let Some(next) = invocation.config.get("next_node_id").and_then(Value::as_str) {
            output["nextNodeId"] = Value::String(next.to_string());
        }

        invocation
            .log
            .info(format!("⏳ Waiting until {}", resume_at.to_rfc3339()), output.clone())
            .await;

        Ok(output)
    }
}

/// Compute when a delay node should resume
pub fn delay_until(config: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(until) = config.get("until").and_then(Value::as_str) {
        return Ok(DateTime::parse_from_rfc3339(until)?.with_timezone(&Utc));
    }

    if let Some(ms) = config.get("duration_ms").and_then(number) {
        return offset(now, Duration::try_milliseconds(ms), ms, "ms");
    }

    let amount = config
        .get("amount")
        .and_then(number)
        .ok_or_else(|| anyhow!("expected 'until', 'duration_ms' or 'amount'"))?;
    let unit = config.get("unit").and_then(Value::as_str).unwrap_or("seconds");

    let duration = match unit {
        "ms" | "milliseconds" => Duration::try_milliseconds(amount),
        "s" | "seconds" => Duration::try_seconds(amount),
        "m" | "minutes" => Duration::try_minutes(amount),
        "h" | "hours" => Duration::try_hours(amount),
        "d" | "days" => Duration::try_days(amount),
        other => return Err(anyhow!("unknown delay unit '{}'", other)),
    };

    offset(now, duration, amount, unit)
}

fn offset(now: DateTime<Utc>, duration: Option<Duration>, amount: i64, unit: &str) -> Result<DateTime<Utc>> {
    duration
        .and_then(|duration| now.checked_add_signed(duration))
        .ok_or_else(|| anyhow!("delay of {} {} is out of range", amount, unit))
}

/// Resolved templates may turn numbers into strings
fn number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Ends the run regardless of outgoing edges
pub struct StopNode;

#[async_trait]
impl NodeHandler for StopNode {
    async fn execute(&self, invocation: NodeInvocation<'_>) -> Result<Value> {
        let reason = invocation.config.get("reason").cloned().unwrap_or(Value::Null);
        Ok(json!({ "action": "stop", "reason": reason }))
    }
}
