//! SWE-bench Verified adapter.
//!
//! Python instances run inside a prepared container image; every command is
//! wrapped in an exec prefix (e.g. `apptainer exec <image>`) taken from the
//! dataset config. There is no compile step, so `check_compile` reports
//! itself skipped and the loop's compile gates pass through.

use crate::adapters::{
    BenchmarkAdapter, CheckoutReport, CompileReport, HarnessInfo, HarnessRequest, TestRun,
    ValidationReport,
};
use crate::tools::read_trigger_test;
use crate::util::{run_cmd, tail_chars};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Ceiling for one single-test execution inside the container.
const SINGLE_TEST_TIMEOUT_SECS: u64 = 600;

pub struct SweBenchAdapter {
    /// Command prefix wrapping every test invocation, usually
    /// `["apptainer", "exec", "<image>"]`. Empty means run directly.
    exec_prefix: Vec<String>,
}

impl SweBenchAdapter {
    pub fn new(exec_prefix: Vec<String>) -> Self {
        Self { exec_prefix }
    }

    /// Build the adapter from the dataset config's `container_exec` entry
    /// (whitespace-separated command prefix).
    pub fn from_environment(environment: &std::collections::HashMap<String, String>) -> Self {
        let exec_prefix = environment
            .get("container_exec")
            .map(|s| s.split_whitespace().map(ToString::to_string).collect())
            .unwrap_or_default();
        Self::new(exec_prefix)
    }

    async fn run_pytest(
        &self,
        workdir: &Path,
        extra_args: &[&str],
    ) -> anyhow::Result<(i32, String, String)> {
        let mut argv: Vec<&str> = self.exec_prefix.iter().map(String::as_str).collect();
        argv.extend(["python", "-m", "pytest", "-rA", "--no-header"]);
        argv.extend(extra_args);
        match argv.split_first() {
            Some((program, args)) => run_cmd(workdir, program, args).await,
            None => anyhow::bail!("empty pytest command"),
        }
    }
}

async fn write_log(logfile: &Path, stdout: &str, stderr: &str) {
    if let Some(parent) = logfile.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let body = format!("{stdout}\n--- stderr ---\n{stderr}\n");
    if let Err(e) = tokio::fs::write(logfile, body).await {
        tracing::warn!(logfile = %logfile.display(), "failed to write test log: {e}");
    }
}

fn looks_like_dependency_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("modulenotfounderror")
        || lower.contains("importerror")
        || lower.contains("no module named")
}

#[async_trait]
impl BenchmarkAdapter for SweBenchAdapter {
    async fn checkout(&self, _pid: &str, _bid: u32, workdir: &Path) -> CheckoutReport {
        // The container image owns the clone; a checkout here just restores
        // the pristine tree.
        if !workdir.exists() {
            return CheckoutReport {
                ok: false,
                stdout: String::new(),
                stderr: format!("workdir not found: {}", workdir.display()),
            };
        }
        let reset = run_cmd(workdir, "git", &["reset", "--hard", "HEAD"]).await;
        let clean = run_cmd(workdir, "git", &["clean", "-fd"]).await;
        match (reset, clean) {
            (Ok((0, stdout, _)), Ok((0, _, _))) => CheckoutReport {
                ok: true,
                stdout,
                stderr: String::new(),
            },
            (Ok((_, stdout, stderr)), _) | (_, Ok((_, stdout, stderr))) => CheckoutReport {
                ok: false,
                stdout,
                stderr,
            },
            (Err(e), _) => CheckoutReport {
                ok: false,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        }
    }

    async fn harness(&self, request: &HarnessRequest) -> HarnessInfo {
        let workdir = &request.workdir;
        let _ = tokio::fs::create_dir_all(&request.meta_dir).await;
        if let Some(parent) = request.full_log.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        if !workdir.exists() {
            return HarnessInfo::failed(
                &request.pid,
                request.bid,
                workdir,
                format!("workdir not found: {}", workdir.display()),
            );
        }
        let checkout = self.checkout(&request.pid, request.bid, workdir).await;
        if !checkout.ok {
            return HarnessInfo::failed(
                &request.pid,
                request.bid,
                workdir,
                format!("tree reset failed: {}", tail_chars(&checkout.stderr, 500)),
            );
        }

        // Reproduce the designated failing test once so its log exists.
        let trigger = read_trigger_test(&request.meta_dir);
        if let Some(test) = &trigger {
            let run = self.run_one_test(workdir, test, &request.trig_log).await;
            if run.is_infrastructure_failure() {
                return HarnessInfo::failed(
                    &request.pid,
                    request.bid,
                    workdir,
                    format!(
                        "trigger test did not execute: {}",
                        run.error.unwrap_or_else(|| "unknown".into())
                    ),
                );
            }
        }

        let mut info = HarnessInfo {
            ok: true,
            workdir: workdir.to_string_lossy().into_owned(),
            pid: request.pid.clone(),
            bid: request.bid,
            ..HarnessInfo::default()
        };
        if let Some(test) = trigger {
            info.extra.insert("trigger_tests".into(), json!([test]));
        }
        info
    }

    async fn check_compile(&self, _workdir: &Path) -> CompileReport {
        CompileReport {
            ok: true,
            skipped: true,
            reason: Some("no compile step for swebench_verified".into()),
            ..CompileReport::default()
        }
    }

    async fn run_one_test(&self, workdir: &Path, test_name: &str, logfile: &Path) -> TestRun {
        let mut run = TestRun {
            ran: false,
            test_name: test_name.to_string(),
            logfile: logfile.display().to_string(),
            ..TestRun::default()
        };
        if !workdir.exists() {
            run.error = Some(format!("workdir not found: {}", workdir.display()));
            return run;
        }

        let execution = tokio::time::timeout(
            Duration::from_secs(SINGLE_TEST_TIMEOUT_SECS),
            self.run_pytest(workdir, &[test_name]),
        )
        .await;

        match execution {
            Err(_) => {
                run.timeout = true;
                run.error = Some(format!("test run exceeded {SINGLE_TEST_TIMEOUT_SECS}s"));
                run
            }
            Ok(Err(e)) => {
                run.error = Some(e.to_string());
                run
            }
            Ok(Ok((rc, stdout, stderr))) => {
                write_log(logfile, &stdout, &stderr).await;
                run.ran = true;
                run.rc = Some(rc);
                run.dependency_error = looks_like_dependency_error(&stderr);
                run.stdout = tail_chars(&stdout, 2000).to_string();
                run.stderr = tail_chars(&stderr, 2000).to_string();
                run
            }
        }
    }

    async fn validate(&self, request: &HarnessRequest) -> anyhow::Result<ValidationReport> {
        let (rc, stdout, stderr) = self.run_pytest(&request.workdir, &[]).await?;
        write_log(&request.full_log, &stdout, &stderr).await;

        let mut report = ValidationReport {
            passed: rc == 0,
            ..ValidationReport::default()
        };
        report.detail.insert("rc".into(), json!(rc));
        report
            .detail
            .insert("stdout".into(), json!(tail_chars(&stdout, 3000)));
        report
            .detail
            .insert("stderr".into(), json!(tail_chars(&stderr, 3000)));
        report.detail.insert(
            "instance_id".into(),
            json!(format!("{}-{}", request.pid, request.bid)),
        );
        Ok(report)
    }
}
