use crate::tools::read_file::{read_numbered_span, resolve_in_workdir};
use crate::tools::Tool;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;

/// Read an exact span of code. Unlike `read_file` both line bounds are
/// required, which counts against the retrieval working-set budget.
pub struct ReadSpanTool {
    workdir: PathBuf,
}

impl ReadSpanTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadSpanTool {
    fn name(&self) -> &str {
        "read_span"
    }

    fn description(&self) -> &str {
        "Read a span of code from a file (workdir-relative supported)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer"},
                "end_line": {"type": "integer"}
            },
            "required": ["path", "start_line", "end_line"]
        })
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return Ok(json!({"ok": false, "error": "missing required field: path"}));
        };
        let (Some(start), Some(end)) = (
            args.get("start_line").and_then(Value::as_i64),
            args.get("end_line").and_then(Value::as_i64),
        ) else {
            return Ok(json!({"ok": false, "error": "start_line and end_line are required"}));
        };
        let resolved = resolve_in_workdir(&self.workdir, path);
        Ok(read_numbered_span(&resolved, start, end))
    }
}
