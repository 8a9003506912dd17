//! Patch text handling.
//!
//! Everything between "the model produced text" and "a patch we are willing
//! to hand to git": markdown cleanup, unified-diff validation, structured
//! edits candidate parsing, modified-file extraction, file Hit@k, and the
//! patch-context snippet derived from localization output or test logs.

use crate::tools::FileEdit;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

static HUNK_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

static DIFF_GIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git\s+a/(\S+)\s+b/(\S+)").unwrap());

static FILE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]{3}\s+[ab]/(\S+)").unwrap());

static JAVA_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^():]+\.java):(\d+)\)").unwrap());

static MAIN_PATH_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(src/(?:main|test)/java/[^\s:]+\.java)\s*[:#]\s*(\d+)").unwrap()
});

static ANY_PATH_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s:]+\.(?:java|py))\s*[:#]\s*(\d+)").unwrap());

static MAIN_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(src/(?:main|test)/java/[^\s]+\.java)").unwrap());

/// Why a unified diff was rejected. `detail()` is what the model gets quoted
/// back at it, and doubles as the failure signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffIssue {
    Empty,
    Placeholder,
    NotUnifiedDiff,
    NoHunks,
    BadLinePrefix {
        line_number: usize,
        line: String,
    },
    CountMismatch {
        hunk_header: String,
        expected_old: usize,
        expected_new: usize,
        seen_old: usize,
        seen_new: usize,
    },
}

impl DiffIssue {
    pub fn detail(&self) -> Value {
        match self {
            DiffIssue::Empty => serde_json::json!({"ok": false, "error": "empty patch"}),
            DiffIssue::Placeholder => {
                serde_json::json!({"ok": false, "error": "patch contains placeholder '...'"})
            }
            DiffIssue::NotUnifiedDiff => serde_json::json!({
                "ok": false,
                "error": "not unified diff (missing diff --git/---/+++)",
            }),
            DiffIssue::NoHunks => {
                serde_json::json!({"ok": false, "error": "no @@ hunks found in patch"})
            }
            DiffIssue::BadLinePrefix { line_number, line } => serde_json::json!({
                "ok": false,
                "error": format!("invalid hunk line prefix at line {line_number}: {}",
                                 crate::util::head_chars(line, 80)),
            }),
            DiffIssue::CountMismatch {
                hunk_header,
                expected_old,
                expected_new,
                seen_old,
                seen_new,
            } => serde_json::json!({
                "ok": false,
                "error": "hunk line counts do not match @@ header",
                "hunk_header": hunk_header,
                "expected_old": expected_old,
                "expected_new": expected_new,
                "seen_old": seen_old,
                "seen_new": seen_new,
            }),
        }
    }
}

/// Quick structural test for git unified diffs.
pub fn is_unified_diff(text: &str) -> bool {
    text.contains("diff --git") && (text.contains("\n--- ") || text.contains("\n+++"))
}

/// Validate unified-diff integrity: at least one `@@` hunk, every body line
/// classified by its first byte, and per-hunk old/new counts matching the
/// header. Placeholder `...` anywhere rejects the patch outright.
pub fn validate_unified_diff(text: &str) -> Result<(), DiffIssue> {
    if text.trim().is_empty() {
        return Err(DiffIssue::Empty);
    }
    if text.contains("...") {
        // Common model failure mode: placeholder instead of real code.
        return Err(DiffIssue::Placeholder);
    }
    if !is_unified_diff(text) {
        return Err(DiffIssue::NotUnifiedDiff);
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut hunks_found = 0usize;
    let mut i = 0usize;
    while i < lines.len() {
        let Some(caps) = HUNK_HEADER_RE.captures(lines[i]) else {
            i += 1;
            continue;
        };
        hunks_found += 1;
        let expected_old: usize = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
        let expected_new: usize = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));

        let mut seen_old = 0usize;
        let mut seen_new = 0usize;
        let mut j = i + 1;
        while j < lines.len() {
            let line = lines[j];
            if line.starts_with("@@ ")
                || line.starts_with("diff --git")
                || line.starts_with("--- ")
                || line.starts_with("+++ ")
            {
                break;
            }
            if line.starts_with("\\ No newline at end of file") {
                j += 1;
                continue;
            }
            if let Some(first) = line.chars().next() {
                match first {
                    ' ' => {
                        seen_old += 1;
                        seen_new += 1;
                    }
                    '-' => seen_old += 1,
                    '+' => seen_new += 1,
                    _ => {
                        return Err(DiffIssue::BadLinePrefix {
                            line_number: j + 1,
                            line: line.to_string(),
                        })
                    }
                }
            } else {
                // An empty line inside a hunk is a context line that lost its
                // leading space somewhere; git rejects it, so do we.
                return Err(DiffIssue::BadLinePrefix {
                    line_number: j + 1,
                    line: String::new(),
                });
            }
            j += 1;
        }

        if seen_old != expected_old || seen_new != expected_new {
            return Err(DiffIssue::CountMismatch {
                hunk_header: lines[i].to_string(),
                expected_old,
                expected_new,
                seen_old,
                seen_new,
            });
        }
        i = j;
    }

    if hunks_found == 0 {
        return Err(DiffIssue::NoHunks);
    }
    Ok(())
}

/// Minimal, non-heuristic patch text cleanup: strip markdown fence lines,
/// slice from the first `diff --git` onward, drop stray trailing backticks.
/// Anything smarter risks truncating a valid diff.
pub fn clean_patch_text(text: &str) -> String {
    let mut cleaned: String = text
        .trim()
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<&str>>()
        .join("\n")
        .trim()
        .to_string();
    if let Some(idx) = cleaned.find("diff --git") {
        cleaned = cleaned[idx..].trim().to_string();
    }
    cleaned.trim_end_matches('`').trim().to_string()
}

/// One structured-edits candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchCandidate {
    pub id: u32,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub reasoning: String,
    pub edits: Vec<FileEdit>,
}

/// Outcome of patch-format detection on model output.
#[derive(Debug)]
pub enum PatchFormat {
    /// Not JSON at all: treat as unified diff.
    UnifiedDiff,
    /// Parsed structured-edits candidates, in model order.
    Structured(Vec<PatchCandidate>),
    /// Valid JSON, but not a recognizable candidate shape.
    StructuredInvalid(String),
}

/// Accepted shapes: `{"patches": [...]}`; a bare candidate list; or the
/// legacy single-candidate form `[{path, ops}]`.
pub fn detect_patch_format(text: &str) -> PatchFormat {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        return PatchFormat::UnifiedDiff;
    };
    let list = match &parsed {
        Value::Object(map) => match map.get("patches") {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                return PatchFormat::StructuredInvalid(
                    "JSON object without a \"patches\" list".into(),
                )
            }
        },
        Value::Array(items) => items.clone(),
        _ => return PatchFormat::StructuredInvalid("JSON is neither object nor list".into()),
    };

    if list.is_empty() {
        return PatchFormat::StructuredInvalid("empty candidate list".into());
    }

    // Multi-candidate form: every entry carries an "edits" list.
    if list.iter().all(|v| v.get("edits").is_some()) {
        let mut candidates = Vec::new();
        for (i, item) in list.iter().enumerate() {
            match serde_json::from_value::<PatchCandidate>(item.clone()) {
                Ok(c) if !c.edits.is_empty() => candidates.push(c),
                Ok(_) => {}
                Err(e) => {
                    return PatchFormat::StructuredInvalid(format!("candidate {}: {e}", i + 1))
                }
            }
        }
        if candidates.is_empty() {
            return PatchFormat::StructuredInvalid("no candidate carries non-empty edits".into());
        }
        return PatchFormat::Structured(candidates);
    }

    // Legacy single-candidate form: a bare list of {path, ops}.
    if list.iter().all(|v| v.get("path").is_some() && v.get("ops").is_some()) {
        return match serde_json::from_value::<Vec<FileEdit>>(Value::Array(list)) {
            Ok(edits) => PatchFormat::Structured(vec![PatchCandidate {
                id: 1,
                strategy: "single patch".into(),
                reasoning: String::new(),
                edits,
            }]),
            Err(e) => PatchFormat::StructuredInvalid(e.to_string()),
        };
    }

    PatchFormat::StructuredInvalid("entries are neither candidates nor {path, ops} edits".into())
}

/// Code-file predicate used by localization and Hit@k accounting: logs,
/// scratch dirs, build output and dependency trees do not count.
pub fn is_code_file(file_path: &str) -> bool {
    if file_path.is_empty() {
        return false;
    }
    let mut path = file_path.trim();
    path = path.strip_prefix("./").unwrap_or(path);
    let normalized = path.strip_prefix('/').unwrap_or(path);

    if normalized.ends_with(".log") || normalized.ends_with(".out") || normalized.ends_with(".err")
    {
        return false;
    }
    const HIDDEN_SCRATCH: &[&str] = &[".swebench", ".agent", ".apr_"];
    if HIDDEN_SCRATCH.iter().any(|p| normalized.starts_with(p)) {
        return false;
    }
    if normalized.contains("/.swebench") || normalized.contains("/.agent") {
        return false;
    }
    if normalized.starts_with(".apr_site/") || normalized.contains("/.apr_site/") {
        return false;
    }
    const BUILD_DIRS: &[&str] = &[
        "__pycache__/",
        ".pytest_cache/",
        ".git/",
        "node_modules/",
        "build/",
        "dist/",
        ".eggs/",
    ];
    if BUILD_DIRS.iter().any(|p| normalized.starts_with(p)) {
        return false;
    }
    if file_path.starts_with('/') && (file_path.contains("/logs/") || file_path.contains("/log/"))
    {
        return false;
    }
    true
}

/// Extract modified code files from a unified diff, in order, deduplicated.
pub fn extract_files_from_patch(patch_text: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        if path != "/dev/null" && is_code_file(path) && !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
    };
    for line in patch_text.lines() {
        if let Some(caps) = DIFF_GIT_RE.captures(line) {
            push(&caps[2]);
            continue;
        }
        if let Some(caps) = FILE_HEADER_RE.captures(line) {
            push(&caps[1]);
        }
    }
    files
}

fn normalize_path(p: &str) -> &str {
    let p = p.trim();
    let p = p.strip_prefix("./").unwrap_or(p);
    p.strip_prefix('/').unwrap_or(p)
}

/// File Hit@k over code files only. Matching is deliberately permissive:
/// exact path, substring either way, or basename equality, so a predicted
/// `Fraction.java` credits a patch to `src/main/java/.../Fraction.java`.
pub fn file_hit_at_k(predicted: &[String], actual: &[String], k: usize) -> bool {
    let predicted: Vec<&str> = predicted
        .iter()
        .filter(|f| is_code_file(f))
        .take(k)
        .map(|f| normalize_path(f))
        .collect();
    let actual: Vec<&str> = actual
        .iter()
        .filter(|f| is_code_file(f))
        .map(|f| normalize_path(f))
        .collect();
    if predicted.is_empty() || actual.is_empty() {
        return false;
    }
    for pred in &predicted {
        for act in &actual {
            if pred == act || act.contains(pred) || pred.contains(act) {
                return true;
            }
            let pred_base = pred.rsplit('/').next().unwrap_or(pred);
            let act_base = act.rsplit('/').next().unwrap_or(act);
            if pred_base == act_base {
                return true;
            }
        }
    }
    false
}

/// A localization target: file plus (optionally) line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub file: String,
    pub line: Option<u32>,
}

/// Best-effort extraction of the patch target from localization output:
/// JSON `{file, line}` first, then `path:line` patterns, then a bare
/// production-source path.
pub fn target_from_localization(localize_text: &str) -> Option<PatchTarget> {
    let trimmed = localize_text.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            let file = map
                .get("file")
                .or_else(|| map.get("path"))
                .and_then(Value::as_str);
            let line = map
                .get("line")
                .or_else(|| map.get("start_line"))
                .and_then(Value::as_u64);
            if let Some(file) = file {
                return Some(PatchTarget {
                    file: file.to_string(),
                    line: line.map(|l| l as u32),
                });
            }
        }
    }

    if let Some(caps) = MAIN_PATH_LINE_RE.captures(localize_text) {
        return Some(PatchTarget {
            file: caps[1].to_string(),
            line: caps[2].parse().ok(),
        });
    }
    if let Some(caps) = ANY_PATH_LINE_RE.captures(localize_text) {
        return Some(PatchTarget {
            file: caps[1].to_string(),
            line: caps[2].parse().ok(),
        });
    }
    MAIN_PATH_RE.captures(localize_text).map(|caps| PatchTarget {
        file: caps[1].to_string(),
        line: None,
    })
}

/// Resolve a bare stack-frame filename (`Fraction.java`) to a
/// workdir-relative path, preferring production sources over tests.
fn resolve_frame_file(workdir: &Path, filename: &str) -> Option<String> {
    let pattern = format!("{}/**/{}", workdir.display(), filename);
    let mut candidates: Vec<std::path::PathBuf> = glob::glob(&pattern)
        .ok()?
        .flatten()
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|p| {
        let s = p.to_string_lossy().into_owned();
        (!s.contains("src/main/java"), s.len())
    });
    candidates[0]
        .strip_prefix(workdir)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Parse Java stack frames out of a log body and resolve the first frame
/// that exists under the workdir. Production frames win over test frames.
pub fn target_from_stack_frames(body: &str, workdir: &Path) -> Option<PatchTarget> {
    let frames: Vec<(String, u32)> = JAVA_FRAME_RE
        .captures_iter(body)
        .filter_map(|caps| Some((caps[1].to_string(), caps[2].parse().ok()?)))
        .collect();
    // First pass: frames that resolve into src/main/java.
    for (filename, line) in &frames {
        if let Some(rel) = resolve_frame_file(workdir, filename) {
            if rel.contains("src/main/java") {
                return Some(PatchTarget {
                    file: rel,
                    line: Some(*line),
                });
            }
        }
    }
    for (filename, line) in &frames {
        if let Some(rel) = resolve_frame_file(workdir, filename) {
            return Some(PatchTarget {
                file: rel,
                line: Some(*line),
            });
        }
    }
    None
}

/// Fallback target extraction from the Defects4J `failing_tests` file.
pub fn target_from_failing_tests(workdir: &Path) -> Option<PatchTarget> {
    let body = std::fs::read_to_string(workdir.join("failing_tests")).ok()?;
    target_from_stack_frames(&body, workdir)
}

/// Fallback target extraction from a red.log stack trace.
pub fn target_from_red_log(red_log: &Path, workdir: &Path) -> Option<PatchTarget> {
    let body = std::fs::read_to_string(red_log).ok()?;
    target_from_stack_frames(&body, workdir)
}

/// Read a numbered snippet of ±`radius` lines around the target line
/// (or the first 200 lines when no line is known).
pub fn read_context_snippet(workdir: &Path, target: &PatchTarget, radius: u32) -> Option<String> {
    let path = workdir.join(&target.file);
    let content = std::fs::read(&path).ok()?;
    let content = String::from_utf8_lossy(&content);
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return None;
    }
    let (start, end) = match target.line {
        Some(line) => {
            let line = line.max(1) as usize;
            (
                line.saturating_sub(radius as usize).max(1),
                (line + radius as usize).min(lines.len()),
            )
        }
        None => (1, lines.len().min(200)),
    };
    if start > lines.len() {
        return None;
    }
    Some(
        (start..=end)
            .map(|i| format!("{i:4}: {}", lines[i - 1]))
            .collect::<Vec<String>>()
            .join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const VALID_DIFF: &str = "diff --git a/Foo.java b/Foo.java\n\
--- a/Foo.java\n\
+++ b/Foo.java\n\
@@ -1,3 +1,3 @@\n \
context\n\
-old\n\
+new\n \
more\n";

    #[test]
    fn valid_diff_passes() {
        assert!(validate_unified_diff(VALID_DIFF).is_ok());
    }

    #[test]
    fn empty_patch_is_rejected() {
        assert_eq!(validate_unified_diff("  \n"), Err(DiffIssue::Empty));
    }

    #[test]
    fn placeholder_is_rejected() {
        let patch = VALID_DIFF.replace("+new", "+...");
        assert_eq!(validate_unified_diff(&patch), Err(DiffIssue::Placeholder));
    }

    #[test]
    fn missing_hunks_are_rejected() {
        let patch = "diff --git a/F b/F\n--- a/F\n+++ b/F\n";
        assert_eq!(validate_unified_diff(patch), Err(DiffIssue::NoHunks));
    }

    #[test]
    fn count_mismatch_reports_exact_diagnostic() {
        // Header declares 5 old lines; body carries only 4.
        let patch = "diff --git a/F.java b/F.java\n\
--- a/F.java\n\
+++ b/F.java\n\
@@ -1,5 +1,5 @@\n \
a\n \
b\n \
c\n\
-d\n\
+e\n \
f\n";
        // 4 context + 1 minus = seen_old 5... adjust: drop one context line.
        let patch = patch.replace(" c\n", "");
        match validate_unified_diff(&patch) {
            Err(DiffIssue::CountMismatch {
                expected_old,
                seen_old,
                expected_new,
                seen_new,
                ..
            }) => {
                assert_eq!(expected_old, 5);
                assert_eq!(seen_old, 4);
                assert_eq!(expected_new, 5);
                assert_eq!(seen_new, 4);
            }
            other => panic!("expected count mismatch, got {other:?}"),
        }
    }

    #[test]
    fn bad_prefix_is_rejected_with_line_number() {
        let patch = "diff --git a/F b/F\n\
--- a/F\n\
+++ b/F\n\
@@ -1,1 +1,1 @@\n\
-old\n\
+new\n\
junk line\n";
        match validate_unified_diff(patch) {
            Err(DiffIssue::BadLinePrefix { line_number, .. }) => assert_eq!(line_number, 7),
            other => panic!("expected bad prefix, got {other:?}"),
        }
    }

    #[test]
    fn headerless_count_defaults_to_one() {
        let patch = "diff --git a/F b/F\n\
--- a/F\n\
+++ b/F\n\
@@ -3 +3 @@\n\
-old\n\
+new\n";
        assert!(validate_unified_diff(patch).is_ok());
    }

    #[test]
    fn no_newline_marker_is_skipped() {
        let patch = "diff --git a/F b/F\n\
--- a/F\n\
+++ b/F\n\
@@ -1,1 +1,1 @@\n\
-old\n\
+new\n\
\\ No newline at end of file\n";
        assert!(validate_unified_diff(patch).is_ok());
    }

    #[test]
    fn clean_strips_fences_and_slices_to_diff() {
        let raw = "Here is the fix:\n```diff\ndiff --git a/F b/F\n--- a/F\n+++ b/F\n```\n";
        let cleaned = clean_patch_text(raw);
        assert!(cleaned.starts_with("diff --git"));
        assert!(!cleaned.contains("```"));
        assert!(!cleaned.contains("Here is"));
    }

    #[test]
    fn clean_drops_trailing_backticks() {
        assert_eq!(clean_patch_text("diff --git a/F b/F```"), "diff --git a/F b/F");
    }

    #[test]
    fn detect_plain_text_as_unified_diff() {
        assert!(matches!(
            detect_patch_format("diff --git a/F b/F"),
            PatchFormat::UnifiedDiff
        ));
    }

    #[test]
    fn detect_patches_object_form() {
        let text = r#"{"patches": [{"id": 1, "strategy": "s", "reasoning": "r",
            "edits": [{"path": "F.java", "ops": [{"type": "delete", "start_line": 1, "end_line": 1}]}]}]}"#;
        match detect_patch_format(text) {
            PatchFormat::Structured(candidates) => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].id, 1);
                assert_eq!(candidates[0].strategy, "s");
            }
            other => panic!("expected structured, got {other:?}"),
        }
    }

    #[test]
    fn detect_legacy_single_candidate_form() {
        let text = r#"[{"path": "Foo.java", "ops": [{"type": "replace", "start_line": 10, "end_line": 10, "text": "return x+1;"}]}]"#;
        match detect_patch_format(text) {
            PatchFormat::Structured(candidates) => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].strategy, "single patch");
                assert_eq!(candidates[0].edits[0].path, "Foo.java");
            }
            other => panic!("expected structured, got {other:?}"),
        }
    }

    #[test]
    fn detect_rejects_json_of_wrong_shape() {
        assert!(matches!(
            detect_patch_format(r#"{"answer": 42}"#),
            PatchFormat::StructuredInvalid(_)
        ));
        assert!(matches!(
            detect_patch_format("[]"),
            PatchFormat::StructuredInvalid(_)
        ));
    }

    #[test]
    fn code_file_predicate_filters_noise() {
        assert!(is_code_file("src/main/java/Foo.java"));
        assert!(is_code_file("astropy/io/fits/card.py"));
        assert!(!is_code_file("logs/red.log"));
        assert!(!is_code_file("build/output.class"));
        assert!(!is_code_file(".apr_site/pkg/mod.py"));
        assert!(!is_code_file("__pycache__/mod.pyc"));
        assert!(!is_code_file("/scratch/logs/test.full.log"));
        assert!(!is_code_file(""));
    }

    #[test]
    fn extracts_files_from_diff_headers() {
        let patch = "diff --git a/src/Foo.java b/src/Foo.java\n\
--- a/src/Foo.java\n\
+++ b/src/Foo.java\n\
diff --git a/logs/x.log b/logs/x.log\n";
        assert_eq!(extract_files_from_patch(patch), vec!["src/Foo.java"]);
    }

    #[test]
    fn hit_at_k_exact_and_basename_matching() {
        let predicted = vec!["src/main/java/Fraction.java".to_string()];
        let actual = vec!["src/main/java/Fraction.java".to_string()];
        assert!(file_hit_at_k(&predicted, &actual, 1));

        let predicted = vec!["Fraction.java".to_string()];
        assert!(file_hit_at_k(&predicted, &actual, 1));

        let predicted = vec!["Other.java".to_string()];
        assert!(!file_hit_at_k(&predicted, &actual, 1));
    }

    #[test]
    fn hit_at_k_respects_rank_cutoff() {
        let predicted = vec![
            "A.java".to_string(),
            "B.java".to_string(),
            "Fraction.java".to_string(),
        ];
        let actual = vec!["src/main/java/Fraction.java".to_string()];
        assert!(!file_hit_at_k(&predicted, &actual, 1));
        assert!(file_hit_at_k(&predicted, &actual, 3));
    }

    #[test]
    fn hit_at_k_absolute_predicted_path_matches_by_substring() {
        let predicted = vec!["/main/java/Fraction.java".to_string()];
        let actual = vec!["src/main/java/Fraction.java".to_string()];
        assert!(file_hit_at_k(&predicted, &actual, 1));
    }

    #[test]
    fn hit_at_k_empty_inputs_never_hit() {
        assert!(!file_hit_at_k(&[], &["a.java".to_string()], 1));
        assert!(!file_hit_at_k(&["a.java".to_string()], &[], 1));
    }

    #[test]
    fn localization_target_from_json() {
        let target =
            target_from_localization(r#"{"file": "src/main/java/F.java", "line": 42}"#).unwrap();
        assert_eq!(target.file, "src/main/java/F.java");
        assert_eq!(target.line, Some(42));
    }

    #[test]
    fn localization_target_from_path_pattern() {
        let target =
            target_from_localization("The bug is at src/main/java/F.java:17 in method foo")
                .unwrap();
        assert_eq!(target.file, "src/main/java/F.java");
        assert_eq!(target.line, Some(17));
    }

    #[test]
    fn localization_target_from_python_path() {
        let target = target_from_localization("see astropy/io/fits/card.py:1284").unwrap();
        assert_eq!(target.file, "astropy/io/fits/card.py");
        assert_eq!(target.line, Some(1284));
    }

    #[test]
    fn localization_target_absent() {
        assert!(target_from_localization("no idea where the bug is").is_none());
    }

    #[test]
    fn stack_frame_target_prefers_production_source() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src/main/java/org")).unwrap();
        fs::create_dir_all(tmp.path().join("src/test/java/org")).unwrap();
        fs::write(tmp.path().join("src/main/java/org/Foo.java"), "x\n").unwrap();
        fs::write(tmp.path().join("src/test/java/org/FooTest.java"), "x\n").unwrap();
        let log = "at org.FooTest.testIt(FooTest.java:10)\nat org.Foo.run(Foo.java:33)\n";
        let target = target_from_stack_frames(log, tmp.path()).unwrap();
        assert_eq!(target.file, "src/main/java/org/Foo.java");
        assert_eq!(target.line, Some(33));
    }

    #[test]
    fn failing_tests_fallback_reads_workdir_file() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("src/main/java")).unwrap();
        fs::write(tmp.path().join("src/main/java/Bar.java"), "a\nb\nc\n").unwrap();
        fs::write(
            tmp.path().join("failing_tests"),
            "--- org.BarTest::testX\nat org.Bar.run(Bar.java:2)\n",
        )
        .unwrap();
        let target = target_from_failing_tests(tmp.path()).unwrap();
        assert_eq!(target.file, "src/main/java/Bar.java");
        assert_eq!(target.line, Some(2));
    }

    #[test]
    fn context_snippet_numbers_window_around_line() {
        let tmp = TempDir::new().unwrap();
        let body: String = (1..=300).map(|i| format!("line{i}\n")).collect();
        fs::write(tmp.path().join("F.java"), body).unwrap();
        let target = PatchTarget {
            file: "F.java".into(),
            line: Some(150),
        };
        let snippet = read_context_snippet(tmp.path(), &target, 80).unwrap();
        assert!(snippet.contains(" 70: line70"));
        assert!(snippet.contains(" 150: line150"));
        assert!(snippet.contains(" 230: line230"));
        assert!(!snippet.contains(" 69: "));
    }

    #[test]
    fn context_snippet_without_line_takes_head() {
        let tmp = TempDir::new().unwrap();
        let body: String = (1..=300).map(|i| format!("line{i}\n")).collect();
        fs::write(tmp.path().join("F.java"), body).unwrap();
        let target = PatchTarget {
            file: "F.java".into(),
            line: None,
        };
        let snippet = read_context_snippet(tmp.path(), &target, 80).unwrap();
        assert!(snippet.contains("   1: line1"));
        assert!(snippet.contains(" 200: line200"));
        assert!(!snippet.contains("201: line201"));
    }
}
