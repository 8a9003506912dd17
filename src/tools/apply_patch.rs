//! Unified-diff application via `git apply`.
//!
//! The patch is always dry-run checked first; a failed check leaves the tree
//! untouched and reports `check_failed` so the loop can classify the failure.
//! A failed real apply resets the tree to keep later attempts clean.

use crate::tools::Tool;
use crate::util::run_cmd;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Apply a unified diff to `workdir`. Returns a JSON report; all failures are
/// values. Used both as the `apply_patch` tool and directly by the loop.
pub async fn apply_unified_diff(workdir: &Path, unified_diff: &str) -> Value {
    if !workdir.exists() {
        return json!({"ok": false, "error": format!("workdir not found: {}", workdir.display())});
    }
    if !workdir.join(".git").exists() {
        return json!({"ok": false, "error": format!("not a git repository: {}", workdir.display())});
    }

    // git apply is picky about the final newline.
    let mut patch = unified_diff.to_string();
    if !patch.is_empty() && !patch.ends_with('\n') {
        patch.push('\n');
    }

    let mut tmp = match NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => return json!({"ok": false, "error": format!("failed to create patch temp file: {e}")}),
    };
    if let Err(e) = tmp.write_all(patch.as_bytes()) {
        return json!({"ok": false, "error": format!("failed to write patch temp file: {e}")});
    }
    let patch_path: PathBuf = tmp.path().to_path_buf();
    let patch_arg = patch_path.to_string_lossy().into_owned();

    // Dry-run first so a rejected patch never dirties the tree.
    match run_cmd(
        workdir,
        "git",
        &["apply", "--check", "--whitespace=nowarn", &patch_arg],
    )
    .await
    {
        Ok((0, _, _)) => {}
        Ok((rc, stdout, stderr)) => {
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return json!({
                "ok": false,
                "error": "patch check failed (patch may be corrupt or incompatible)",
                "check_failed": true,
                "rc": rc,
                "stderr": crate::util::head_chars(&detail, 800),
            });
        }
        Err(e) => return json!({"ok": false, "error": format!("{e}")}),
    }

    match run_cmd(
        workdir,
        "git",
        &[
            "apply",
            "--whitespace=nowarn",
            "--ignore-space-change",
            "--ignore-whitespace",
            &patch_arg,
        ],
    )
    .await
    {
        Ok((0, _, _)) => json!({"ok": true, "applied": true}),
        Ok((rc, stdout, stderr)) => {
            let detail = if stderr.is_empty() { stdout } else { stderr };
            let _ = run_cmd(workdir, "git", &["reset", "--hard"]).await;
            json!({
                "ok": false,
                "error": "git apply failed; repo reset",
                "rc": rc,
                "stderr": crate::util::head_chars(&detail, 800),
            })
        }
        Err(e) => json!({"ok": false, "error": format!("{e}")}),
    }
}

pub struct ApplyPatchTool {
    workdir: PathBuf,
}

impl ApplyPatchTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to the working tree (git apply, checked first)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": {"type": "string", "description": "Unified diff text starting with 'diff --git'."}
            },
            "required": ["patch"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(patch) = args.get("patch").and_then(Value::as_str) else {
            return Ok(json!({"ok": false, "error": "missing required field: patch"}));
        };
        Ok(apply_unified_diff(&self.workdir, patch).await)
    }
}
