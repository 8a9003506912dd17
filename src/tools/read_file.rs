use crate::tools::Tool;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Read a window of a file with 1-based line numbers. Relative paths resolve
/// against the workdir. Defaults to the first 200 lines.
pub struct ReadFileTool {
    workdir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, absolute or workdir-relative."},
                "start_line": {"type": "integer", "description": "First line to read (1-based, default 1)."},
                "end_line": {"type": "integer", "description": "Last line to read (inclusive, default 200)."}
            },
            "required": ["path"]
        })
    }
}

pub(crate) fn read_numbered_span(path: &Path, start_line: i64, end_line: i64) -> Value {
    if !path.exists() {
        return json!({"ok": false, "error": format!("file not found: {}", path.display())});
    }
    if path.is_dir() {
        return json!({"ok": false, "error": format!("path is a directory, not a file: {}", path.display())});
    }
    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => return json!({"ok": false, "error": format!("read failed: {e}")}),
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = start_line.max(1) as usize;
    let end = (end_line.max(0) as usize).min(lines.len());
    if start > lines.len() || end < start {
        return json!({
            "ok": false,
            "error": format!("line range {start}-{end} out of bounds (file has {} lines)", lines.len()),
        });
    }
    let snippet: Vec<String> = (start..=end)
        .map(|i| format!("{i}: {}", lines[i - 1]))
        .collect();
    json!({
        "ok": true,
        "path": path.display().to_string(),
        "start_line": start,
        "end_line": end,
        "snippet": snippet.join("\n"),
    })
}

pub(crate) fn resolve_in_workdir(workdir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workdir.join(p)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read file lines with line numbers"
    }

    fn parameters_schema(&self) -> Value {
        Self::schema()
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return Ok(json!({"ok": false, "error": "missing required field: path"}));
        };
        let start = args.get("start_line").and_then(Value::as_i64).unwrap_or(1);
        let end = args.get("end_line").and_then(Value::as_i64).unwrap_or(200);
        let resolved = resolve_in_workdir(&self.workdir, path);
        Ok(read_numbered_span(&resolved, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_numbered_window() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Foo.java"), "alpha\nbeta\ngamma\n").unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let out = tool
            .execute(json!({"path": "Foo.java", "start_line": 2, "end_line": 3}))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["snippet"], "2: beta\n3: gamma");
        assert_eq!(out["start_line"], 2);
    }

    #[tokio::test]
    async fn defaults_to_first_200_lines() {
        let tmp = TempDir::new().unwrap();
        let body: String = (0..300).map(|i| format!("line{i}\n")).collect();
        fs::write(tmp.path().join("big.txt"), body).unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let out = tool.execute(json!({"path": "big.txt"})).await.unwrap();
        assert_eq!(out["end_line"], 200);
    }

    #[tokio::test]
    async fn rejects_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("src")).unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let out = tool.execute(json!({"path": "src"})).await.unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("directory"));
    }

    #[tokio::test]
    async fn missing_file_reports_error() {
        let tmp = TempDir::new().unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let out = tool.execute(json!({"path": "nope.java"})).await.unwrap();
        assert_eq!(out["ok"], false);
    }

    #[tokio::test]
    async fn missing_path_argument_reports_error() {
        let tmp = TempDir::new().unwrap();
        let tool = ReadFileTool::new(tmp.path());
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out["ok"], false);
    }
}
