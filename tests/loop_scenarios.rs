//! End-to-end repair-loop scenarios against a scripted provider and a
//! scripted benchmark adapter, with a real git workdir underneath so apply,
//! diff and reset behave exactly as in production.

use async_trait::async_trait;
use parking_lot::Mutex;
use patchpilot::adapters::{
    BenchmarkAdapter, CheckoutReport, CompileReport, HarnessInfo, HarnessRequest, TestRun,
    ValidationReport,
};
use patchpilot::agent::{run_repair_loop, LoopHandles, RunOutcome};
use patchpilot::config::{AblationConfig, PromptSet};
use patchpilot::providers::traits::ChatRequest;
use patchpilot::providers::{ChatResponse, Provider, TokenUsage, ToolCall};
use patchpilot::tools::{setup_tools, ToolSetup, ToolSetupParams};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Scripted provider ─────────────────────────────────────────────────────

enum Scripted {
    Text(&'static str),
    OwnedText(String),
    Calls(Vec<ToolCall>),
    Fail(&'static str),
}

struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn chat(&self, _request: ChatRequest<'_>) -> anyhow::Result<ChatResponse> {
        let step = self
            .script
            .lock()
            .pop_front()
            .expect("provider script exhausted");
        let usage = Some(TokenUsage {
            prompt_tokens: Some(100),
            completion_tokens: Some(20),
            total_tokens: Some(120),
        });
        match step {
            Scripted::Text(text) => Ok(ChatResponse {
                text: Some(text.to_string()),
                tool_calls: Vec::new(),
                usage,
            }),
            Scripted::OwnedText(text) => Ok(ChatResponse {
                text: Some(text),
                tool_calls: Vec::new(),
                usage,
            }),
            Scripted::Calls(tool_calls) => Ok(ChatResponse {
                text: None,
                tool_calls,
                usage,
            }),
            Scripted::Fail(message) => anyhow::bail!("{message}"),
        }
    }
}

// ── Scripted adapter ──────────────────────────────────────────────────────

struct ScriptedAdapter {
    workdir: PathBuf,
    red_run: Option<TestRun>,
    green_run: Option<TestRun>,
    compile_reports: Mutex<VecDeque<CompileReport>>,
    validations: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedAdapter {
    fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            red_run: None,
            green_run: None,
            compile_reports: Mutex::new(VecDeque::new()),
            validations: Mutex::new(VecDeque::new()),
        }
    }

    fn with_red(mut self, run: TestRun) -> Self {
        self.red_run = Some(run);
        self
    }

    fn with_green(mut self, run: TestRun) -> Self {
        self.green_run = Some(run);
        self
    }

    fn with_compiles(self, reports: Vec<CompileReport>) -> Self {
        *self.compile_reports.lock() = reports.into();
        self
    }

    fn with_validations(self, reports: Vec<ValidationReport>) -> Self {
        *self.validations.lock() = reports.into();
        self
    }
}

#[async_trait]
impl BenchmarkAdapter for ScriptedAdapter {
    async fn checkout(&self, _pid: &str, _bid: u32, _workdir: &Path) -> CheckoutReport {
        CheckoutReport {
            ok: true,
            ..CheckoutReport::default()
        }
    }

    async fn harness(&self, request: &HarnessRequest) -> HarnessInfo {
        HarnessInfo {
            ok: true,
            workdir: self.workdir.to_string_lossy().into_owned(),
            pid: request.pid.clone(),
            bid: request.bid,
            ..HarnessInfo::default()
        }
    }

    async fn check_compile(&self, _workdir: &Path) -> CompileReport {
        self.compile_reports.lock().pop_front().unwrap_or(CompileReport {
            ok: true,
            ..CompileReport::default()
        })
    }

    async fn run_one_test(&self, _workdir: &Path, test_name: &str, _logfile: &Path) -> TestRun {
        // RED and GREEN share the trigger test name; scenarios that need both
        // wrap this adapter in [`GateAdapter`], which keys off call order.
        self.red_run.clone().unwrap_or(TestRun {
            ran: true,
            rc: Some(1),
            test_name: test_name.to_string(),
            ..TestRun::default()
        })
    }

    async fn validate(&self, _request: &HarnessRequest) -> anyhow::Result<ValidationReport> {
        Ok(self
            .validations
            .lock()
            .pop_front()
            .unwrap_or_else(|| ValidationReport::failed_with("no scripted validation")))
    }
}

/// GREEN-aware adapter: returns `red_run` for the first single-test call and
/// `green_run` afterwards, mirroring the gate ordering in a run.
struct GateAdapter {
    inner: ScriptedAdapter,
    single_test_calls: Mutex<u32>,
}

impl GateAdapter {
    fn new(inner: ScriptedAdapter) -> Self {
        Self {
            inner,
            single_test_calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl BenchmarkAdapter for GateAdapter {
    async fn checkout(&self, pid: &str, bid: u32, workdir: &Path) -> CheckoutReport {
        self.inner.checkout(pid, bid, workdir).await
    }

    async fn harness(&self, request: &HarnessRequest) -> HarnessInfo {
        self.inner.harness(request).await
    }

    async fn check_compile(&self, workdir: &Path) -> CompileReport {
        self.inner.check_compile(workdir).await
    }

    async fn run_one_test(&self, _workdir: &Path, test_name: &str, _logfile: &Path) -> TestRun {
        let mut calls = self.single_test_calls.lock();
        *calls += 1;
        let scripted = if *calls == 1 {
            self.inner.red_run.clone()
        } else {
            self.inner.green_run.clone()
        };
        scripted.unwrap_or(TestRun {
            ran: true,
            rc: Some(1),
            test_name: test_name.to_string(),
            ..TestRun::default()
        })
    }

    async fn validate(&self, request: &HarnessRequest) -> anyhow::Result<ValidationReport> {
        self.inner.validate(request).await
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(status.status.success(), "git {args:?} failed");
}

/// Workdir with Foo.java under git, plus meta/log dirs and a trigger file.
fn fixture() -> (TempDir, HarnessRequest) {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("workdir");
    std::fs::create_dir_all(&workdir).unwrap();
    git(&workdir, &["init", "-q"]);
    git(&workdir, &["config", "user.email", "t@t"]);
    git(&workdir, &["config", "user.name", "t"]);
    std::fs::write(workdir.join("Foo.java"), "line one\nline two\nline three\n").unwrap();
    git(&workdir, &["add", "."]);
    git(&workdir, &["commit", "-q", "-m", "init"]);

    let meta_dir = tmp.path().join("meta");
    let log_dir = tmp.path().join("logs");
    std::fs::create_dir_all(&meta_dir).unwrap();
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::write(meta_dir.join("tests.trigger.txt"), "org.example.FooTest::testIt\n").unwrap();

    let request = HarnessRequest {
        pid: "Lang".into(),
        bid: 1,
        workdir,
        meta_dir,
        full_log: log_dir.join("test.full.log"),
        trig_log: log_dir.join("test.trigger.log"),
        index_dir: None,
    };
    (tmp, request)
}

fn prompts() -> PromptSet {
    PromptSet {
        system: "You fix bugs.".into(),
        localize: "Find the bug.".into(),
        patch: "Produce a patch.".into(),
    }
}

fn build_tools(
    request: &HarnessRequest,
    adapter: Arc<dyn BenchmarkAdapter>,
    config: &AblationConfig,
) -> ToolSetup {
    setup_tools(ToolSetupParams {
        workdir: &request.workdir,
        meta_dir: &request.meta_dir,
        red_log: &request.meta_dir.join("red.log"),
        green_log: &request.meta_dir.join("green.log"),
        red_test_name: Some("org.example.FooTest::testIt".into()),
        adapter,
        config,
    })
}

async fn drive(
    provider: Arc<dyn Provider>,
    adapter: Arc<dyn BenchmarkAdapter>,
    request: HarnessRequest,
    config: AblationConfig,
    max_iters: u32,
) -> RunOutcome {
    let tools = build_tools(&request, adapter.clone(), &config);
    let red_log = request.meta_dir.join("red.log");
    run_repair_loop(LoopHandles {
        provider,
        api_model: "test-model".into(),
        prompts: prompts(),
        adapter,
        tools,
        request,
        config,
        max_iters,
        read_log_hint: "Read red.log first.".into(),
        red_log,
        cancel: CancellationToken::new(),
    })
    .await
}

fn passing_validation() -> ValidationReport {
    let mut report = ValidationReport {
        passed: true,
        ..ValidationReport::default()
    };
    report.detail.insert("rc".into(), serde_json::json!(0));
    report
}

const GOOD_PATCH: &str = "diff --git a/Foo.java b/Foo.java\n\
--- a/Foo.java\n\
+++ b/Foo.java\n\
@@ -1,3 +1,3 @@\n \
line one\n\
-line two\n\
+line 2\n \
line three\n";

/// Hunk header declares 3/3 but the body carries 2/2.
const MISMATCHED_PATCH: &str = "diff --git a/Foo.java b/Foo.java\n\
--- a/Foo.java\n\
+++ b/Foo.java\n\
@@ -1,3 +1,3 @@\n\
-line two\n\
+line 2\n \
line three\n";

// ── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_single_file_fix() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(
        ScriptedAdapter::new(&request.workdir).with_validations(vec![passing_validation()]),
    );
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::Text(GOOD_PATCH),
    ]);
    let config = AblationConfig::from_variant("G0").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(outcome.ok, "expected success: {:?}", outcome.error);
    assert_eq!(outcome.iterations, Some(1));
    assert!(outcome.patch.as_deref().unwrap().contains("diff --git"));
    assert_eq!(outcome.metrics.patch_attempts, 1);
    assert_eq!(outcome.metrics.apply_attempt_count, 1);
    assert_eq!(outcome.metrics.apply_success_count, 1);
    assert!(outcome.metrics.file_hit_at_1);
    assert_eq!(
        outcome.metrics.total_api_calls,
        outcome.metrics.localization.api_calls + outcome.metrics.patch.api_calls
    );
    assert_eq!(outcome.metrics.total_tokens, 240);
    assert!(outcome.harness_ok);
}

#[tokio::test]
async fn format_churn_then_structured_edits_recovery() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(
        ScriptedAdapter::new(&request.workdir)
            .with_compiles(vec![CompileReport {
                ok: true,
                ..CompileReport::default()
            }])
            .with_validations(vec![passing_validation()]),
    );
    let structured = r#"[{"path":"Foo.java","ops":[{"type":"replace","start_line":2,"end_line":2,"text":"line 2"}]}]"#;
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::Text(MISMATCHED_PATCH),
        Scripted::Text(MISMATCHED_PATCH),
        Scripted::Text(MISMATCHED_PATCH),
        Scripted::OwnedText(structured.to_string()),
    ]);
    let config = AblationConfig::from_variant("G3").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(outcome.ok, "expected success: {:?}", outcome.error);
    // The accepted patch is the canonical git diff of the structured edits.
    let patch = outcome.patch.as_deref().unwrap();
    assert!(patch.starts_with("diff --git"));
    assert!(patch.contains("+line 2"));
    assert_eq!(outcome.metrics.patch_attempts, 4);
    assert_eq!(outcome.metrics.compile_success_count, 1);
    assert_eq!(outcome.metrics.git_apply_failures, 0);
}

#[tokio::test]
async fn compile_gate_rejects_candidates_until_one_compiles() {
    let (_tmp, request) = fixture();
    let fail = |summary: &str| CompileReport {
        ok: false,
        rc: Some(1),
        error_summary: summary.to_string(),
        ..CompileReport::default()
    };
    let inner = ScriptedAdapter::new(&request.workdir)
        .with_red(TestRun {
            ran: true,
            rc: Some(1),
            test_name: "org.example.FooTest::testIt".into(),
            ..TestRun::default()
        })
        .with_green(TestRun {
            ran: true,
            rc: Some(0),
            test_name: "org.example.FooTest::testIt".into(),
            ..TestRun::default()
        })
        .with_compiles(vec![
            // RED-gate pre-compile, then one report per candidate.
            CompileReport {
                ok: true,
                ..CompileReport::default()
            },
            fail("cannot find symbol A"),
            fail("cannot find symbol B"),
            CompileReport {
                ok: true,
                ..CompileReport::default()
            },
        ])
        .with_validations(vec![passing_validation()]);
    let adapter = Arc::new(GateAdapter::new(inner));

    let candidates = r#"{"patches": [
        {"id": 1, "strategy": "guard null", "reasoning": "",
         "edits": [{"path": "Foo.java", "ops": [{"type": "replace", "start_line": 1, "end_line": 1, "text": "guarded one"}]}]},
        {"id": 2, "strategy": "swap operands", "reasoning": "",
         "edits": [{"path": "Foo.java", "ops": [{"type": "replace", "start_line": 1, "end_line": 1, "text": "swapped one"}]}]},
        {"id": 3, "strategy": "fix comparison", "reasoning": "",
         "edits": [{"path": "Foo.java", "ops": [{"type": "replace", "start_line": 2, "end_line": 2, "text": "line 2"}]}]}
    ]}"#;
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::OwnedText(candidates.to_string()),
    ]);
    let config = AblationConfig::from_variant("G5").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(outcome.ok, "expected success: {:?}", outcome.error);
    assert_eq!(outcome.metrics.compile_failures, 2);
    assert_eq!(outcome.metrics.compile_attempt_count, 3);
    assert_eq!(outcome.metrics.compile_success_count, 1);
    assert!(outcome.metrics.tdd_gate_red_verified);
    assert!(outcome.metrics.tdd_gate_green_verified);
    assert!(outcome.patch.as_deref().unwrap().contains("+line 2"));
}

#[tokio::test]
async fn red_infrastructure_error_is_fatal() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir).with_red(TestRun {
        ran: false,
        rc: Some(-1),
        test_name: "org.example.FooTest::testIt".into(),
        error: Some("container exec failed".into()),
        ..TestRun::default()
    }));
    // The gate rejects before any model call; an empty script proves it.
    let provider = ScriptedProvider::new(vec![]);
    let config = AblationConfig::from_variant("G1").unwrap();

    let outcome = drive(provider, adapter, request, config, 3).await;

    assert!(!outcome.ok);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("RED test execution failed"));
    assert!(!outcome.metrics.tdd_gate_red_verified);
    assert_eq!(outcome.metrics.total_api_calls, 0);
    assert!(outcome.red_result.is_some());
}

#[tokio::test]
async fn red_test_passing_is_fatal() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir).with_red(TestRun {
        ran: true,
        rc: Some(0),
        test_name: "org.example.FooTest::testIt".into(),
        ..TestRun::default()
    }));
    let provider = ScriptedProvider::new(vec![]);
    let config = AblationConfig::from_variant("G1").unwrap();

    let outcome = drive(provider, adapter, request, config, 3).await;

    assert!(!outcome.ok);
    assert!(outcome.error.as_deref().unwrap().contains("did not fail"));
}

#[tokio::test]
async fn quota_exhaustion_stops_without_retry() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir));
    let provider = ScriptedProvider::new(vec![
        Scripted::Calls(vec![ToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: r#"{"path": "Foo.java"}"#.into(),
        }]),
        Scripted::Fail("provider returned 402: Insufficient Balance"),
    ]);
    let config = AblationConfig::from_variant("G0").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(!outcome.ok);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("credits/quota exhausted"));
    // One successful call counted, the failed one not.
    assert_eq!(outcome.metrics.total_api_calls, 1);
    assert_eq!(outcome.metrics.localization.api_calls, 1);
    assert_eq!(outcome.metrics.localization.tool_calls_by_type["read_file"], 1);
}

#[tokio::test]
async fn zero_iterations_runs_harness_and_red_gate_only() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir).with_red(TestRun {
        ran: true,
        rc: Some(1),
        test_name: "org.example.FooTest::testIt".into(),
        ..TestRun::default()
    }));
    let provider = ScriptedProvider::new(vec![]);
    let config = AblationConfig::from_variant("G1").unwrap();

    let outcome = drive(provider, adapter, request, config, 0).await;

    assert!(!outcome.ok);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("Reached max iterations"));
    assert!(outcome.harness_ok);
    assert!(outcome.metrics.tdd_gate_red_verified);
    assert_eq!(outcome.metrics.total_api_calls, 0);
    assert!(outcome.metrics.runtime_seconds >= 0.0);
}

#[tokio::test]
async fn unit_budgets_one_call_per_phase() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir));
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::Text("this is not a patch at all"),
    ]);
    let mut config = AblationConfig::from_variant("G0").unwrap();
    config.max_localization_api_calls = 1;
    config.max_patch_phase_api_calls = 1;
    config.max_tool_calls_per_patch = 1;
    config.max_consecutive_direct_patches = 1;
    config.max_git_apply_failures = 1;
    config.max_compile_failures = 1;

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.metrics.localization.api_calls, 1);
    assert_eq!(outcome.metrics.patch.api_calls, 1);
    assert_eq!(outcome.metrics.total_api_calls, 2);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("Reached max iterations"));
}

#[tokio::test]
async fn validation_failure_resets_tree_and_feeds_back() {
    let (_tmp, request) = fixture();
    let workdir = request.workdir.clone();
    let mut failing = ValidationReport::default();
    failing.detail.insert("rc".into(), serde_json::json!(1));
    failing.detail.insert(
        "stderr".into(),
        serde_json::json!("AssertionError: expected 2 but was 3"),
    );
    let adapter = Arc::new(
        ScriptedAdapter::new(&request.workdir)
            .with_validations(vec![failing, passing_validation()]),
    );
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::Text(GOOD_PATCH),
        Scripted::Text(GOOD_PATCH),
    ]);
    let config = AblationConfig::from_variant("G0").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(outcome.ok, "expected eventual success: {:?}", outcome.error);
    assert_eq!(outcome.metrics.validation_failures, 1);
    assert_eq!(outcome.metrics.apply_attempt_count, 2);
    assert_eq!(outcome.metrics.apply_success_count, 2);
    // The second apply only succeeds if the reset restored the tree.
    let content = std::fs::read_to_string(workdir.join("Foo.java")).unwrap();
    assert!(content.contains("line 2"));
}

#[tokio::test]
async fn repeated_apply_failures_stop_early() {
    let (_tmp, request) = fixture();
    let adapter = Arc::new(ScriptedAdapter::new(&request.workdir));
    // Context that does not exist in Foo.java: git apply --check rejects it,
    // the same way, twice; repeat policy stops the phase.
    let bad_patch = GOOD_PATCH.replace("line one", "nonexistent context");
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::OwnedText(bad_patch.clone()),
        Scripted::OwnedText(bad_patch),
    ]);
    let config = AblationConfig::from_variant("G0").unwrap();

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.metrics.git_apply_failures, 2);
    assert_eq!(outcome.metrics.apply_attempt_count, 2);
    assert_eq!(outcome.metrics.apply_success_count, 0);
}

#[tokio::test]
async fn green_failure_rejects_early_and_continues() {
    let (_tmp, request) = fixture();
    let inner = ScriptedAdapter::new(&request.workdir)
        .with_red(TestRun {
            ran: true,
            rc: Some(1),
            test_name: "org.example.FooTest::testIt".into(),
            ..TestRun::default()
        })
        .with_green(TestRun {
            ran: true,
            rc: Some(1),
            test_name: "org.example.FooTest::testIt".into(),
            ..TestRun::default()
        })
        .with_validations(vec![passing_validation()]);
    let adapter = Arc::new(GateAdapter::new(inner));
    let provider = ScriptedProvider::new(vec![
        Scripted::Text(r#"{"file": "Foo.java", "line": 2}"#),
        Scripted::Text(GOOD_PATCH),
        Scripted::Text(GOOD_PATCH),
    ]);
    let mut config = AblationConfig::from_variant("G1").unwrap();
    // Keep the retry bounded: the second GREEN run also fails, so the phase
    // would grind until a budget trips; one is enough for this scenario.
    config.max_patch_phase_api_calls = 2;

    let outcome = drive(provider, adapter, request, config, 1).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.metrics.early_rejection, Some(true));
    assert!(!outcome.metrics.tdd_gate_green_verified);
    assert_eq!(outcome.metrics.validation_failures, 0);
}
