//! Retrieval-index lookups.
//!
//! The index is a JSON file produced ahead of time
//! (`<pid>-<bid>b_index.json`) mapping symbols to definition blocks and
//! reference sites. These tools only read it; building the index is someone
//! else's job.

use crate::tools::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

const DEFAULT_MAX_CANDIDATES: usize = 10;

#[derive(Debug, Deserialize)]
struct SymbolIndex {
    #[serde(default)]
    symbols: std::collections::HashMap<String, Vec<SymbolEntry>>,
    #[serde(default)]
    references: std::collections::HashMap<String, Vec<ReferenceEntry>>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct SymbolEntry {
    file: String,
    start_line: u32,
    end_line: u32,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct ReferenceEntry {
    file: String,
    line: u32,
}

fn load_index(index_path: &str) -> Result<SymbolIndex, Value> {
    let path = Path::new(index_path);
    if !path.exists() {
        return Err(json!({"ok": false, "error": format!("index not found: {index_path}")}));
    }
    let body = std::fs::read_to_string(path)
        .map_err(|e| json!({"ok": false, "error": format!("failed to read index: {e}")}))?;
    serde_json::from_str(&body)
        .map_err(|e| json!({"ok": false, "error": format!("invalid index JSON: {e}")}))
}

/// Index keys are fully qualified; fall back to suffix matching so
/// `Fraction.getReducedFraction` finds `org.apache...Fraction.getReducedFraction`.
fn matching_keys<'a, T>(
    map: &'a std::collections::HashMap<String, Vec<T>>,
    symbol: &str,
) -> Vec<&'a String> {
    if map.contains_key(symbol) {
        return map.keys().filter(|k| k.as_str() == symbol).collect();
    }
    let suffix = format!(".{symbol}");
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| k.ends_with(&suffix) || k.as_str() == symbol)
        .collect();
    keys.sort();
    keys
}

/// Look up symbol definition blocks in the retrieval index.
pub struct SymbolLookupTool;

#[async_trait]
impl Tool for SymbolLookupTool {
    fn name(&self) -> &str {
        "symbol_lookup"
    }

    fn description(&self) -> &str {
        "Look up a symbol definition in the retrieval index"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index_path": {"type": "string"},
                "symbol": {"type": "string"},
                "max_candidates": {"type": "integer"}
            },
            "required": ["index_path", "symbol"]
        })
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let (Some(index_path), Some(symbol)) = (
            args.get("index_path").and_then(Value::as_str),
            args.get("symbol").and_then(Value::as_str),
        ) else {
            return Ok(json!({"ok": false, "error": "index_path and symbol are required"}));
        };
        let max_candidates = args
            .get("max_candidates")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_MAX_CANDIDATES, |n| n as usize);

        let index = match load_index(index_path) {
            Ok(index) => index,
            Err(report) => return Ok(report),
        };

        let mut candidates = Vec::new();
        for key in matching_keys(&index.symbols, symbol) {
            for entry in &index.symbols[key] {
                candidates.push(json!({
                    "symbol": key,
                    "file": entry.file,
                    "start_line": entry.start_line,
                    "end_line": entry.end_line,
                    "kind": entry.kind,
                    "signature": entry.signature,
                }));
            }
        }
        let truncated = candidates.len() > max_candidates;
        candidates.truncate(max_candidates);
        Ok(json!({
            "ok": true,
            "symbol": symbol,
            "candidates": candidates,
            "truncated": truncated,
        }))
    }
}

/// Find reference sites for a symbol in the retrieval index.
pub struct FindReferencesTool;

#[async_trait]
impl Tool for FindReferencesTool {
    fn name(&self) -> &str {
        "find_references"
    }

    fn description(&self) -> &str {
        "Find references to a symbol in the retrieval index"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "index_path": {"type": "string"},
                "symbol": {"type": "string"}
            },
            "required": ["index_path", "symbol"]
        })
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> anyhow::Result<Value> {
        let (Some(index_path), Some(symbol)) = (
            args.get("index_path").and_then(Value::as_str),
            args.get("symbol").and_then(Value::as_str),
        ) else {
            return Ok(json!({"ok": false, "error": "index_path and symbol are required"}));
        };
        let index = match load_index(index_path) {
            Ok(index) => index,
            Err(report) => return Ok(report),
        };
        let mut references = Vec::new();
        for key in matching_keys(&index.references, symbol) {
            for entry in &index.references[key] {
                references.push(json!({
                    "symbol": key,
                    "file": entry.file,
                    "line": entry.line,
                }));
            }
        }
        Ok(json!({"ok": true, "symbol": symbol, "references": references}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_index(dir: &TempDir) -> String {
        let path = dir.path().join("Lang-21b_index.json");
        fs::write(
            &path,
            r#"{
                "symbols": {
                    "org.apache.commons.lang3.math.Fraction.reduce": [
                        {"file": "src/main/java/Fraction.java", "start_line": 100, "end_line": 120, "kind": "method"}
                    ]
                },
                "references": {
                    "org.apache.commons.lang3.math.Fraction.reduce": [
                        {"file": "src/test/java/FractionTest.java", "line": 55}
                    ]
                }
            }"#,
        )
        .unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn lookup_matches_by_suffix() {
        let tmp = TempDir::new().unwrap();
        let index = write_index(&tmp);
        let out = SymbolLookupTool
            .execute(json!({"index_path": index, "symbol": "Fraction.reduce"}))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        let candidates = out["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0]["start_line"], 100);
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn lookup_caps_candidates() {
        let tmp = TempDir::new().unwrap();
        let entries: Vec<String> = (0..15)
            .map(|i| {
                format!(
                    r#"{{"file": "F{i}.java", "start_line": {i}, "end_line": {i}}}"#
                )
            })
            .collect();
        let path = tmp.path().join("idx.json");
        fs::write(
            &path,
            format!(r#"{{"symbols": {{"dup": [{}]}}}}"#, entries.join(",")),
        )
        .unwrap();
        let out = SymbolLookupTool
            .execute(json!({"index_path": path.to_string_lossy(), "symbol": "dup"}))
            .await
            .unwrap();
        assert_eq!(out["candidates"].as_array().unwrap().len(), 10);
        assert_eq!(out["truncated"], true);
    }

    #[tokio::test]
    async fn references_found_for_qualified_symbol() {
        let tmp = TempDir::new().unwrap();
        let index = write_index(&tmp);
        let out = FindReferencesTool
            .execute(json!({
                "index_path": index,
                "symbol": "org.apache.commons.lang3.math.Fraction.reduce"
            }))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["references"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_index_reports_error() {
        let out = SymbolLookupTool
            .execute(json!({"index_path": "/no/such/index.json", "symbol": "x"}))
            .await
            .unwrap();
        assert_eq!(out["ok"], false);
    }
}
