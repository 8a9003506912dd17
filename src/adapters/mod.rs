//! Benchmark adapters.
//!
//! A [`BenchmarkAdapter`] owns everything benchmark-specific: preparing a
//! buggy checkout, compiling, running one test, and running the full
//! validation suite. The repair loop only ever sees the report types defined
//! here; adapter failures travel as values, not panics.

pub mod defects4j;
pub mod swebench;

pub use defects4j::Defects4jAdapter;
pub use swebench::SweBenchAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Opaque benchmark context returned by [`BenchmarkAdapter::harness`].
///
/// The loop interprets only `ok`, `workdir` and `index_path`; everything else
/// rides along in `extra` and is surfaced verbatim to the model and the
/// terminal result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarnessInfo {
    pub ok: bool,
    pub workdir: String,
    pub pid: String,
    pub bid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_suite_verification: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HarnessInfo {
    pub fn failed(pid: &str, bid: u32, workdir: &Path, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            workdir: workdir.to_string_lossy().into_owned(),
            pid: pid.to_string(),
            bid,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Result of preparing (or re-preparing) a buggy checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckoutReport {
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Fast compile check report.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompileReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error_summary: String,
    /// True when the benchmark has no compile step (SWE-bench).
    #[serde(default)]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CompileReport {
    /// Best available human-readable failure text.
    pub fn summary(&self) -> &str {
        if !self.error_summary.is_empty() {
            &self.error_summary
        } else if !self.stderr.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

/// One single-test execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestRun {
    /// False when the infrastructure never actually executed the test.
    pub ran: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    pub test_name: String,
    pub logfile: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub dependency_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestRun {
    /// `ran=false` or an rc of -1/255 (or none at all) means the harness
    /// infrastructure failed, not the test.
    pub fn is_infrastructure_failure(&self) -> bool {
        if !self.ran || self.timeout || self.dependency_error {
            return true;
        }
        match self.rc {
            None => true,
            Some(rc) => rc == -1 || rc == 255,
        }
    }
}

/// Full-suite validation verdict plus adapter-shaped detail
/// (`rc`/`stdout`/`stderr` for SWE-bench, `test_full`/`test_trigger` for
/// Defects4J).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(flatten)]
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl ValidationReport {
    pub fn failed_with(error: impl Into<String>) -> Self {
        let mut detail = serde_json::Map::new();
        detail.insert("error".into(), serde_json::Value::String(error.into()));
        Self {
            passed: false,
            detail,
        }
    }
}

/// Everything the harness needs to prepare one bug instance.
#[derive(Debug, Clone)]
pub struct HarnessRequest {
    pub pid: String,
    pub bid: u32,
    pub workdir: std::path::PathBuf,
    pub meta_dir: std::path::PathBuf,
    pub full_log: std::path::PathBuf,
    pub trig_log: std::path::PathBuf,
    pub index_dir: Option<std::path::PathBuf>,
}

/// Capability surface the repair loop relies on.
#[async_trait]
pub trait BenchmarkAdapter: Send + Sync {
    /// Whether the loop must guard JAVA_HOME/PATH against index-build
    /// upgrades after the harness runs. Only Defects4J needs this.
    fn needs_java_env_guard(&self) -> bool {
        false
    }

    /// Prepare a fresh buggy checkout at `workdir`.
    async fn checkout(&self, pid: &str, bid: u32, workdir: &Path) -> CheckoutReport;

    /// Initialize the environment for one instance: checkout, trigger-test
    /// export, reproduction run. Failures are reported via `HarnessInfo.ok`.
    async fn harness(&self, request: &HarnessRequest) -> HarnessInfo;

    /// Fast compile check of the current workdir state.
    async fn check_compile(&self, workdir: &Path) -> CompileReport;

    /// Run a single test, teeing output into `logfile`.
    async fn run_one_test(&self, workdir: &Path, test_name: &str, logfile: &Path) -> TestRun;

    /// Run the benchmark's full validation suite against the current workdir
    /// state. An `Err` is an adapter exception, not a test failure.
    async fn validate(&self, request: &HarnessRequest) -> anyhow::Result<ValidationReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_failure_detection() {
        let run = TestRun {
            ran: false,
            rc: Some(1),
            ..TestRun::default()
        };
        assert!(run.is_infrastructure_failure());

        let run = TestRun {
            ran: true,
            rc: Some(-1),
            ..TestRun::default()
        };
        assert!(run.is_infrastructure_failure());

        let run = TestRun {
            ran: true,
            rc: Some(255),
            ..TestRun::default()
        };
        assert!(run.is_infrastructure_failure());

        let run = TestRun {
            ran: true,
            rc: None,
            ..TestRun::default()
        };
        assert!(run.is_infrastructure_failure());

        let run = TestRun {
            ran: true,
            rc: Some(1),
            ..TestRun::default()
        };
        assert!(!run.is_infrastructure_failure());
    }

    #[test]
    fn dependency_error_is_infrastructure() {
        let run = TestRun {
            ran: true,
            rc: Some(1),
            dependency_error: true,
            ..TestRun::default()
        };
        assert!(run.is_infrastructure_failure());
    }

    #[test]
    fn compile_summary_prefers_error_summary() {
        let report = CompileReport {
            ok: false,
            error_summary: "summary".into(),
            stderr: "stderr".into(),
            stdout: "stdout".into(),
            ..CompileReport::default()
        };
        assert_eq!(report.summary(), "summary");

        let report = CompileReport {
            ok: false,
            stderr: "stderr".into(),
            stdout: "stdout".into(),
            ..CompileReport::default()
        };
        assert_eq!(report.summary(), "stderr");

        let report = CompileReport {
            ok: false,
            stdout: "stdout".into(),
            ..CompileReport::default()
        };
        assert_eq!(report.summary(), "stdout");
    }

    #[test]
    fn harness_info_extra_fields_flatten() {
        let mut info = HarnessInfo {
            ok: true,
            workdir: "/tmp/w".into(),
            pid: "Lang".into(),
            bid: 1,
            ..HarnessInfo::default()
        };
        info.extra
            .insert("failing_tests".into(), serde_json::json!(["a::b"]));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["failing_tests"][0], "a::b");
        assert_eq!(json["workdir"], "/tmp/w");
    }

    #[test]
    fn validation_report_flattens_detail() {
        let mut report = ValidationReport::failed_with("boom");
        report.detail.insert("rc".into(), serde_json::json!(2));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["rc"], 2);
        assert_eq!(json["error"], "boom");
    }
}
