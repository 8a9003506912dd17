//! Defects4J adapter.
//!
//! Shells out to the `defects4j` CLI: checkout, compile, single-test and
//! full-suite runs. The framework reports rc=0 even when tests fail, so test
//! verdicts come from its "Failing tests" output and the `failing_tests`
//! file it drops in the workdir.

use crate::adapters::{
    BenchmarkAdapter, CheckoutReport, CompileReport, HarnessInfo, HarnessRequest, TestRun,
    ValidationReport,
};
use crate::tools::read_trigger_test;
use crate::util::tail_chars;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Ceiling for one single-test execution.
const SINGLE_TEST_TIMEOUT_SECS: u64 = 600;

pub struct Defects4jAdapter {
    /// Environment exported to every `defects4j` invocation (JAVA_HOME and
    /// friends from the dataset config).
    environment: HashMap<String, String>,
}

impl Defects4jAdapter {
    pub fn new(environment: HashMap<String, String>) -> Self {
        Self { environment }
    }

    async fn d4j(&self, dir: &Path, args: &[&str]) -> anyhow::Result<(i32, String, String)> {
        let mut cmd = Command::new("defects4j");
        cmd.args(args).current_dir(dir);
        for (key, value) in &self.environment {
            cmd.env(key, value);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to run defects4j {args:?}: {e}"))?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    /// Derive a test verdict from a `defects4j test` run: command failure
    /// wins, otherwise the reported failing-test count decides.
    fn test_rc(command_rc: i32, stdout: &str) -> i32 {
        if command_rc != 0 {
            return command_rc;
        }
        let failing = stdout
            .lines()
            .find_map(|l| l.strip_prefix("Failing tests:"))
            .and_then(|rest| rest.trim().parse::<u32>().ok())
            .unwrap_or(0);
        i32::from(failing > 0)
    }

    fn failing_tests(workdir: &Path) -> Vec<String> {
        std::fs::read_to_string(workdir.join("failing_tests"))
            .map(|body| {
                body.lines()
                    .filter_map(|l| l.strip_prefix("--- "))
                    .map(|l| l.trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
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

#[async_trait]
impl BenchmarkAdapter for Defects4jAdapter {
    fn needs_java_env_guard(&self) -> bool {
        true
    }

    async fn checkout(&self, pid: &str, bid: u32, workdir: &Path) -> CheckoutReport {
        if let Some(parent) = workdir.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let version = format!("{bid}b");
        let workdir_arg = workdir.to_string_lossy().into_owned();
        match self
            .d4j(
                workdir.parent().unwrap_or(Path::new(".")),
                &["checkout", "-p", pid, "-v", &version, "-w", &workdir_arg],
            )
            .await
        {
            Ok((rc, stdout, stderr)) => CheckoutReport {
                ok: rc == 0,
                stdout,
                stderr,
            },
            Err(e) => CheckoutReport {
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

        // Fresh checkout unless a defects4j worktree is already in place.
        if !workdir.join(".defects4j.config").exists() {
            let checkout = self.checkout(&request.pid, request.bid, workdir).await;
            if !checkout.ok {
                return HarnessInfo::failed(
                    &request.pid,
                    request.bid,
                    workdir,
                    format!("checkout failed: {}", tail_chars(&checkout.stderr, 500)),
                );
            }
        }

        // Export the trigger tests for the TDD gates and reproduction run.
        let trigger_tests = match self.d4j(workdir, &["export", "-p", "tests.trigger"]).await {
            Ok((0, stdout, _)) => {
                let body = stdout.trim().to_string();
                if let Err(e) =
                    std::fs::write(request.meta_dir.join("tests.trigger.txt"), format!("{body}\n"))
                {
                    tracing::warn!("failed to write tests.trigger.txt: {e}");
                }
                body.lines().map(|l| l.trim().to_string()).collect()
            }
            Ok((rc, _, stderr)) => {
                tracing::warn!(rc, "tests.trigger export failed: {}", tail_chars(&stderr, 300));
                Vec::new()
            }
            Err(e) => {
                return HarnessInfo::failed(&request.pid, request.bid, workdir, e.to_string())
            }
        };

        // Reproduce the failure once so failing_tests and the trigger log
        // exist before the model looks at anything.
        if let Some(trigger) = trigger_tests.first() {
            let run = self
                .run_one_test(workdir, trigger, &request.trig_log)
                .await;
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

        let index_path = request.index_dir.as_ref().map(|dir| {
            dir.join(format!("{}-{}b_index.json", request.pid, request.bid))
                .to_string_lossy()
                .into_owned()
        });

        let mut info = HarnessInfo {
            ok: true,
            workdir: workdir.to_string_lossy().into_owned(),
            pid: request.pid.clone(),
            bid: request.bid,
            index_path,
            ..HarnessInfo::default()
        };
        info.extra
            .insert("trigger_tests".into(), json!(trigger_tests));
        info.extra
            .insert("failing_tests".into(), json!(Self::failing_tests(workdir)));
        info
    }

    async fn check_compile(&self, workdir: &Path) -> CompileReport {
        if !workdir.exists() {
            return CompileReport {
                ok: false,
                error_summary: format!("workdir not found: {}", workdir.display()),
                ..CompileReport::default()
            };
        }
        match self.d4j(workdir, &["compile"]).await {
            Ok((rc, stdout, stderr)) => CompileReport {
                ok: rc == 0,
                rc: Some(rc),
                error_summary: if rc == 0 {
                    String::new()
                } else {
                    tail_chars(if stderr.is_empty() { &stdout } else { &stderr }, 2000)
                        .to_string()
                },
                stdout,
                stderr,
                ..CompileReport::default()
            },
            Err(e) => CompileReport {
                ok: false,
                rc: Some(-1),
                error_summary: e.to_string(),
                ..CompileReport::default()
            },
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
            self.d4j(workdir, &["test", "-t", test_name]),
        )
        .await;

        match execution {
            Err(_) => {
                run.timeout = true;
                run.error = Some(format!(
                    "test run exceeded {SINGLE_TEST_TIMEOUT_SECS}s"
                ));
                run
            }
            Ok(Err(e)) => {
                run.error = Some(e.to_string());
                run
            }
            Ok(Ok((rc, stdout, stderr))) => {
                write_log(logfile, &stdout, &stderr).await;
                run.ran = true;
                run.rc = Some(Self::test_rc(rc, &stdout));
                run.stdout = tail_chars(&stdout, 2000).to_string();
                run.stderr = tail_chars(&stderr, 2000).to_string();
                run
            }
        }
    }

    async fn validate(&self, request: &HarnessRequest) -> anyhow::Result<ValidationReport> {
        let workdir = &request.workdir;

        let (compile_rc, _, compile_err) = self.d4j(workdir, &["compile"]).await?;
        if compile_rc != 0 {
            let mut report = ValidationReport::default();
            report.detail.insert(
                "test_full".into(),
                json!({
                    "rc": compile_rc,
                    "test_rc": compile_rc,
                    "stderr": tail_chars(&compile_err, 2000),
                    "logfile": request.full_log.display().to_string(),
                }),
            );
            return Ok(report);
        }

        let (rc, stdout, stderr) = self.d4j(workdir, &["test"]).await?;
        write_log(&request.full_log, &stdout, &stderr).await;
        let test_rc = Self::test_rc(rc, &stdout);
        let failing = Self::failing_tests(workdir);

        // Trigger tests again, for the focused log.
        let trigger = read_trigger_test(&request.meta_dir);
        let trigger_run = match &trigger {
            Some(name) => Some(self.run_one_test(workdir, name, &request.trig_log).await),
            None => None,
        };

        let passed = test_rc == 0 && failing.is_empty();
        let mut report = ValidationReport {
            passed,
            ..ValidationReport::default()
        };
        report.detail.insert(
            "test_full".into(),
            json!({
                "rc": rc,
                "test_rc": test_rc,
                "failing_tests": failing,
                "stdout": tail_chars(&stdout, 2000),
                "stderr": tail_chars(&stderr, 2000),
                "logfile": request.full_log.display().to_string(),
            }),
        );
        if let Some(run) = trigger_run {
            report.detail.insert(
                "test_trigger".into(),
                json!({
                    "passed": run.rc == Some(0),
                    "rc": run.rc,
                    "test_name": run.test_name,
                    "logfile": run.logfile,
                    "stderr": run.stderr,
                }),
            );
        }
        Ok(report)
    }
}
