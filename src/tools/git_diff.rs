use crate::tools::Tool;
use crate::util::run_cmd;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Canonical diff of the current tree state (`git diff --no-color`).
pub async fn get_git_diff(workdir: &Path) -> Value {
    if !workdir.exists() {
        return json!({"ok": false, "error": format!("workdir not found: {}", workdir.display())});
    }
    if !workdir.join(".git").exists() {
        return json!({"ok": false, "error": format!("not a git repository: {}", workdir.display())});
    }
    match run_cmd(workdir, "git", &["diff", "--no-color"]).await {
        Ok((0, stdout, _)) => {
            let has_changes = !stdout.trim().is_empty();
            json!({
                "ok": true,
                "diff": if has_changes { stdout } else { String::new() },
                "has_changes": has_changes,
            })
        }
        Ok((rc, _, stderr)) => json!({"ok": false, "error": "git diff failed", "rc": rc, "stderr": stderr}),
        Err(e) => json!({"ok": false, "error": format!("{e}")}),
    }
}

/// Throw away uncommitted changes. Best effort: a missing workdir or a
/// non-repo is logged and ignored so rejection paths never fail on cleanup.
pub async fn reset_to_head(workdir: &Path) {
    if !workdir.exists() || !workdir.join(".git").exists() {
        return;
    }
    if let Err(e) = run_cmd(workdir, "git", &["reset", "--hard", "HEAD"]).await {
        tracing::warn!("failed to reset workdir after rejected patch: {e}");
    }
}

pub struct GetGitDiffTool {
    workdir: PathBuf,
}

impl GetGitDiffTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Tool for GetGitDiffTool {
    fn name(&self) -> &str {
        "get_git_diff"
    }

    fn description(&self) -> &str {
        "Return the unified diff of current uncommitted changes in the working tree"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
        Ok(get_git_diff(&self.workdir).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn git_fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        run_cmd(dir, "git", &["init", "-q"]).await.unwrap();
        run_cmd(dir, "git", &["config", "user.email", "t@t"]).await.unwrap();
        run_cmd(dir, "git", &["config", "user.name", "t"]).await.unwrap();
        fs::write(dir.join("a.txt"), "one\n").unwrap();
        run_cmd(dir, "git", &["add", "."]).await.unwrap();
        run_cmd(dir, "git", &["commit", "-q", "-m", "init"]).await.unwrap();
        tmp
    }

    #[tokio::test]
    async fn clean_tree_has_no_changes() {
        let tmp = git_fixture().await;
        let out = get_git_diff(tmp.path()).await;
        assert_eq!(out["ok"], true);
        assert_eq!(out["has_changes"], false);
        assert_eq!(out["diff"], "");
    }

    #[tokio::test]
    async fn dirty_tree_yields_unified_diff() {
        let tmp = git_fixture().await;
        fs::write(tmp.path().join("a.txt"), "changed\n").unwrap();
        let out = get_git_diff(tmp.path()).await;
        assert_eq!(out["ok"], true);
        assert_eq!(out["has_changes"], true);
        assert!(out["diff"].as_str().unwrap().starts_with("diff --git"));
    }

    #[tokio::test]
    async fn reset_restores_clean_state() {
        let tmp = git_fixture().await;
        fs::write(tmp.path().join("a.txt"), "changed\n").unwrap();
        reset_to_head(tmp.path()).await;
        let out = get_git_diff(tmp.path()).await;
        assert_eq!(out["has_changes"], false);
        assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "one\n");
    }

    #[tokio::test]
    async fn non_repo_reports_error() {
        let tmp = TempDir::new().unwrap();
        let out = get_git_diff(tmp.path()).await;
        assert_eq!(out["ok"], false);
    }
}
