//! Reflective tool dispatcher.
//!
//! Turns a batch of LLM tool calls into tool replies: parses (and repairs)
//! argument JSON, refuses names outside the registered set without revealing
//! what else exists, memoizes read-only calls, and serializes each report
//! into the reply body.

use crate::agent::conversation::ToolReply;
use crate::providers::ToolCall;
use crate::tools::Tool;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ToolRuntime {
    tools: HashMap<String, Arc<dyn Tool>>,
    cache: HashMap<String, Value>,
}

impl ToolRuntime {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let tools = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Self {
            tools,
            cache: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// The memo cache lives for one loop invocation; the orchestrator clears
    /// it on entry.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Invoke a registered tool directly (used by the loop for `apply_edits`,
    /// `get_git_diff`, `check_compile` and the verify gates). Bypasses the
    /// cache.
    pub async fn call_by_name(&self, name: &str, args: Value) -> Value {
        match self.tools.get(name) {
            Some(tool) => execute_to_report(tool.as_ref(), args).await,
            None => unknown_tool_report(name),
        }
    }

    /// Execute a batch of tool calls in order, producing one reply per call.
    pub async fn handle_tool_calls(&mut self, calls: &[ToolCall]) -> Vec<ToolReply> {
        let mut replies = Vec::with_capacity(calls.len());
        for call in calls {
            let args = parse_arguments(&call.arguments, &call.name);
            let report = self.dispatch(&call.name, args).await;
            replies.push(ToolReply {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: serde_json::to_string(&report).unwrap_or_else(|_| "{}".into()),
            });
        }
        replies
    }

    async fn dispatch(&mut self, name: &str, args: Value) -> Value {
        let Some(tool) = self.tools.get(name).cloned() else {
            tracing::warn!(tool = name, "LLM requested unregistered tool");
            return unknown_tool_report(name);
        };

        if tool.cacheable() {
            let key = cache_key(name, &args);
            if let Some(cached) = self.cache.get(&key) {
                tracing::debug!(tool = name, "returning memoized tool result");
                let mut hit = cached.clone();
                if let Some(obj) = hit.as_object_mut() {
                    obj.insert("_cached".into(), Value::Bool(true));
                }
                return hit;
            }
            let report = execute_to_report(tool.as_ref(), args).await;
            if report.get("ok").and_then(Value::as_bool) == Some(true) {
                self.cache.insert(key, report.clone());
            }
            return report;
        }

        execute_to_report(tool.as_ref(), args).await
    }
}

async fn execute_to_report(tool: &dyn Tool, args: Value) -> Value {
    match tool.execute(args).await {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(tool = tool.name(), "tool execution failed: {err:#}");
            json!({"ok": false, "error": format!("{err:#}")})
        }
    }
}

fn unknown_tool_report(name: &str) -> Value {
    // Deliberately does not enumerate registered tools: the model must not
    // discover capabilities outside the current phase.
    json!({
        "ok": false,
        "error": format!("Tool '{name}' is not available in the current phase."),
    })
}

/// Parse tool-call arguments, repairing the common truncated-JSON failure
/// mode once before giving up and substituting an empty object.
fn parse_arguments(raw: &str, tool_name: &str) -> Value {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return normalize_object(value);
    }

    tracing::warn!(
        tool = tool_name,
        "failed to parse tool arguments, attempting repair: {}",
        crate::util::head_chars(raw, 200)
    );
    let mut repaired = raw.trim().to_string();
    if !repaired.ends_with('}') {
        if let Some(last) = repaired.rfind('}') {
            repaired.truncate(last + 1);
        } else {
            repaired = format!("{}}}", repaired.trim_end_matches(','));
        }
    }
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => normalize_object(value),
        Err(_) => {
            tracing::warn!(tool = tool_name, "argument repair failed, using empty object");
            Value::Object(Map::new())
        }
    }
}

fn normalize_object(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        Value::Object(Map::new())
    }
}

/// Content-addressed key: tool name plus arguments with object keys sorted
/// at every level, so semantically identical calls share one entry.
fn cache_key(name: &str, args: &Value) -> String {
    format!("{name}:{}", canonical_json(args))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
