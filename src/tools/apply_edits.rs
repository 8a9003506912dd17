//! Structured line edits.
//!
//! The alternate patch surface: a JSON list of per-file operations with
//! 1-based inclusive line ranges. Ops are applied per file in descending
//! `start_line` order so earlier line numbers stay valid, and files whose
//! content is unchanged after editing are not written (or reported as
//! applied).

use crate::tools::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// One line-level operation. `text` is auto-terminated with a newline when
/// non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOp {
    /// Replace lines `[start_line, end_line]` (inclusive).
    Replace {
        start_line: u32,
        end_line: u32,
        text: String,
    },
    /// Insert before `start_line`.
    Insert { start_line: u32, text: String },
    /// Delete lines `[start_line, end_line]` (inclusive).
    Delete { start_line: u32, end_line: u32 },
}

impl EditOp {
    fn start_line(&self) -> u32 {
        match self {
            EditOp::Replace { start_line, .. }
            | EditOp::Insert { start_line, .. }
            | EditOp::Delete { start_line, .. } => *start_line,
        }
    }
}

/// All operations for one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEdit {
    pub path: String,
    pub ops: Vec<EditOp>,
}

fn terminated(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut t = text.to_string();
    if !t.ends_with('\n') {
        t.push('\n');
    }
    t.split_inclusive('\n').map(ToString::to_string).collect()
}

fn apply_ops(lines: &mut Vec<String>, ops: &[EditOp]) {
    // Descending start_line keeps earlier indices valid.
    let mut ordered: Vec<&EditOp> = ops.iter().collect();
    ordered.sort_by(|a, b| b.start_line().cmp(&a.start_line()));

    for op in ordered {
        match op {
            EditOp::Replace {
                start_line,
                end_line,
                text,
            } => {
                let start = (start_line.saturating_sub(1) as usize).min(lines.len());
                let end = (*end_line as usize).min(lines.len()).max(start);
                lines.splice(start..end, terminated(text));
            }
            EditOp::Insert { start_line, text } => {
                let at = (start_line.saturating_sub(1) as usize).min(lines.len());
                let mut inserted = terminated(text);
                lines.splice(at..at, inserted.drain(..));
            }
            EditOp::Delete {
                start_line,
                end_line,
            } => {
                let start = (start_line.saturating_sub(1) as usize).min(lines.len());
                let end = (*end_line as usize).min(lines.len()).max(start);
                lines.drain(start..end);
            }
        }
    }
}

/// Apply structured edits under `workdir`. Returns `{ok, applied_files}`
/// plus a warning when every edit turned out to be a no-op.
pub fn apply_file_edits(workdir: &Path, edits: &[FileEdit]) -> Value {
    if !workdir.exists() {
        return json!({"ok": false, "error": format!("workdir not found: {}", workdir.display())});
    }

    let mut applied_files: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for edit in edits {
        let file_path = workdir.join(&edit.path);
        if !file_path.exists() {
            errors.push(format!("File not found: {}", edit.path));
            continue;
        }
        let original = match std::fs::read(&file_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                errors.push(format!("Error reading {}: {e}", edit.path));
                continue;
            }
        };

        let mut lines: Vec<String> = original.split_inclusive('\n').map(ToString::to_string).collect();
        apply_ops(&mut lines, &edit.ops);
        let mut updated: String = lines.concat();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }

        // No-op edits (modulo trailing whitespace) are skipped so an
        // "applied" report always reflects a real tree change.
        if original.trim_end() == updated.trim_end() {
            tracing::debug!(path = %edit.path, "edits produced no content change, skipping write");
            continue;
        }

        if let Err(e) = std::fs::write(&file_path, &updated) {
            errors.push(format!("Error writing {}: {e}", edit.path));
            continue;
        }
        applied_files.push(edit.path.clone());
    }

    if !errors.is_empty() {
        return json!({
            "ok": false,
            "error": errors.join("; "),
            "applied_files": applied_files,
        });
    }
    if applied_files.is_empty() {
        return json!({
            "ok": true,
            "applied_files": [],
            "warning": "No files were modified (edits resulted in no actual changes)",
        });
    }
    json!({"ok": true, "applied_files": applied_files})
}

/// Parse the edits payload a model produced: either an array value or a JSON
/// string containing one.
pub fn parse_file_edits(value: &Value) -> anyhow::Result<Vec<FileEdit>> {
    let parsed: Vec<FileEdit> = match value {
        Value::String(s) => serde_json::from_str(s)?,
        other => serde_json::from_value(other.clone())?,
    };
    Ok(parsed)
}

pub struct ApplyEditsTool {
    workdir: PathBuf,
}

impl ApplyEditsTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ApplyEditsTool {
    fn name(&self) -> &str {
        "apply_edits"
    }

    fn description(&self) -> &str {
        "Apply structured line edits (replace/insert/delete) to files in the working tree"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "description": "List of {path, ops}; each op is replace/insert/delete with 1-based line numbers.",
                    "items": {"type": "object"}
                },
                "edits_json": {
                    "type": "string",
                    "description": "Same payload as a JSON string (model compatibility)."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        // Some models send `edits`, others `edits_json`.
        let payload = args
            .get("edits")
            .or_else(|| args.get("edits_json"))
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let edits = match parse_file_edits(&payload) {
            Ok(edits) => edits,
            Err(e) => return Ok(json!({"ok": false, "error": format!("Invalid JSON: {e}")})),
        };
        Ok(apply_file_edits(&self.workdir, &edits))
    }
}
