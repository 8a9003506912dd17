use crate::tools::Tool;
use crate::util::run_cmd;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_HITS: usize = 50;

/// Substring search under a root directory. Shells out to ripgrep when
/// available and falls back to a recursive scan otherwise.
pub struct SearchInFilesTool;

impl SearchInFilesTool {
    pub fn new() -> Self {
        Self
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Literal text to search for."},
                "root": {"type": "string", "description": "Directory to search under."},
                "glob": {"type": "string", "description": "Glob filter for candidate files (default **/*)."},
                "max_hits": {"type": "integer", "description": "Maximum hits to return (default 50)."}
            },
            "required": ["query", "root"]
        })
    }
}

async fn search_with_rg(
    rg: &Path,
    query: &str,
    root: &Path,
    glob_pat: &str,
    max_hits: usize,
) -> Value {
    let rg = rg.to_string_lossy().into_owned();
    let result = run_cmd(
        root,
        &rg,
        &["-n", "--no-heading", "--fixed-strings", "--glob", glob_pat, query, "."],
    )
    .await;
    let (rc, stdout, stderr) = match result {
        Ok(v) => v,
        Err(e) => return json!({"ok": false, "error": format!("rg failed to start: {e}")}),
    };
    // rc=1 just means no matches.
    if rc != 0 && rc != 1 {
        return json!({"ok": false, "error": "rg failed", "rc": rc, "stderr": stderr});
    }
    let mut hits = Vec::new();
    for line in stdout.lines().take(max_hits) {
        let mut parts = line.splitn(3, ':');
        let (Some(path), Some(lineno), Some(text)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(lineno) = lineno.parse::<u64>() else {
            continue;
        };
        hits.push(json!({
            "path": path.trim_start_matches("./"),
            "line": lineno,
            "text": text,
        }));
    }
    json!({"ok": true, "engine": "rg", "hits": hits})
}

fn search_fallback(query: &str, root: &Path, glob_pat: &str, max_hits: usize) -> Value {
    let pattern = match glob::Pattern::new(glob_pat) {
        Ok(p) => p,
        Err(e) => return json!({"ok": false, "error": format!("invalid glob: {e}")}),
    };
    let mut hits = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if !pattern.matches_path(rel) {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let content = String::from_utf8_lossy(&bytes);
            for (i, line) in content.lines().enumerate() {
                if line.contains(query) {
                    hits.push(json!({
                        "path": rel.to_string_lossy(),
                        "line": i + 1,
                        "text": line,
                    }));
                    if hits.len() >= max_hits {
                        return json!({"ok": true, "engine": "walk", "hits": hits});
                    }
                }
            }
        }
    }
    json!({"ok": true, "engine": "walk", "hits": hits})
}

#[async_trait]
impl Tool for SearchInFilesTool {
    fn name(&self) -> &str {
        "search_in_files"
    }

    fn description(&self) -> &str {
        "Search query under root"
    }

    fn parameters_schema(&self) -> Value {
        Self::schema()
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(query) = args.get("query").and_then(Value::as_str) else {
            return Ok(json!({"ok": false, "error": "missing required field: query"}));
        };
        let Some(root) = args.get("root").and_then(Value::as_str) else {
            return Ok(json!({"ok": false, "error": "missing required field: root"}));
        };
        // Models occasionally pass start_line/end_line here; ignore them.
        let glob_pat = args.get("glob").and_then(Value::as_str).unwrap_or("**/*");
        let max_hits = args
            .get("max_hits")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_MAX_HITS, |n| n as usize);

        let root_path = PathBuf::from(root);
        if !root_path.exists() {
            return Ok(json!({"ok": false, "error": format!("root not found: {root}")}));
        }

        if let Ok(rg) = which::which("rg") {
            return Ok(search_with_rg(&rg, query, &root_path, glob_pat, max_hits).await);
        }
        Ok(search_fallback(query, &root_path, glob_pat, max_hits))
    }
}
