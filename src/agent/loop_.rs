//! The repair loop.
//!
//! Drives one bug instance through harness setup, the optional RED gate, and
//! up to `max_iters` localize/patch iterations, enforcing every budget along
//! the way. Control is single-threaded and cooperative: the wall-clock
//! deadline is polled at every suspension point, and an in-flight adapter
//! call is never killed, only refused a successor.

use crate::adapters::{
    BenchmarkAdapter, CompileReport, HarnessInfo, HarnessRequest, TestRun, ValidationReport,
};
use crate::agent::conversation::Conversation;
use crate::agent::feedback::{FailureKind, PatchFeedback};
use crate::agent::metrics::{Metrics, Phase};
use crate::agent::patching::{
    clean_patch_text, detect_patch_format, is_code_file, read_context_snippet,
    target_from_failing_tests, target_from_localization, target_from_red_log,
    validate_unified_diff, PatchFormat, PatchTarget,
};
use crate::config::{AblationConfig, PromptSet};
use crate::providers::{
    with_retry, ChatResponse, ErrorClass, Provider, RetryError, ToolChoice, ToolCall,
};
use crate::providers::traits::ChatRequest;
use crate::tools::{
    apply_file_edits, apply_unified_diff, get_git_diff, reset_to_head, ToolSetup, ToolSpec,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Wall-clock ceiling for one run.
const MAX_RUNTIME_SECONDS: u64 = 1200;
/// Tool-call ceiling inside one localization phase.
const MAX_LOCALIZE_TOOL_CALLS: u32 = 15;
/// Harness JSON larger than this is injected as head + tail.
const HARNESS_JSON_CAP: usize = 8000;
const HARNESS_JSON_HEAD: usize = 4000;
const HARNESS_JSON_TAIL: usize = 2000;
/// Context snippet radius around the localized line.
const PATCH_CONTEXT_RADIUS: u32 = 80;

/// Everything the loop needs to run one instance.
pub struct LoopHandles {
    pub provider: Arc<dyn Provider>,
    pub api_model: String,
    pub prompts: PromptSet,
    pub adapter: Arc<dyn BenchmarkAdapter>,
    pub tools: ToolSetup,
    pub request: HarnessRequest,
    pub config: AblationConfig,
    pub max_iters: u32,
    pub read_log_hint: String,
    pub red_log: PathBuf,
    pub cancel: CancellationToken,
}

/// Terminal result of one run; serialized to stdout as the process output.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: Metrics,
    pub harness_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_result: Option<CompileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red_result: Option<TestRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_suite_verification: Option<Value>,
}

/// Run the repair loop for one bug instance.
pub async fn run_repair_loop(handles: LoopHandles) -> RunOutcome {
    RepairLoop::new(handles).run().await
}

struct RepairLoop {
    provider: Arc<dyn Provider>,
    api_model: String,
    prompts: PromptSet,
    adapter: Arc<dyn BenchmarkAdapter>,
    tools: ToolSetup,
    request: HarnessRequest,
    config: AblationConfig,
    max_iters: u32,
    read_log_hint: String,
    red_log: PathBuf,
    cancel: CancellationToken,
    started: Instant,
    metrics: Metrics,
    harness: HarnessInfo,
    initial_compile: Option<CompileReport>,
    red_result: Option<TestRun>,
    last_patch: Option<String>,
    /// Once flipped, unified diffs stay rejected for the rest of the run,
    /// across iterations.
    force_structured_edits: bool,
}

/// How one patch-loop pass ended.
enum PatchPassOutcome {
    /// Keep looping inside the patch phase.
    Continue,
    /// Leave the patch phase, move to the next iteration.
    Break,
    /// Terminal: the whole run is over.
    Terminal(RunOutcome),
}

impl RepairLoop {
    fn new(handles: LoopHandles) -> Self {
        Self {
            provider: handles.provider,
            api_model: handles.api_model,
            prompts: handles.prompts,
            adapter: handles.adapter,
            tools: handles.tools,
            request: handles.request,
            config: handles.config,
            max_iters: handles.max_iters,
            read_log_hint: handles.read_log_hint,
            red_log: handles.red_log,
            cancel: handles.cancel,
            started: Instant::now(),
            metrics: Metrics::default(),
            harness: HarnessInfo::default(),
            initial_compile: None,
            red_result: None,
            last_patch: None,
            force_structured_edits: false,
        }
    }

    fn workdir(&self) -> PathBuf {
        PathBuf::from(&self.harness.workdir)
    }

    fn deadline_exceeded(&self) -> bool {
        self.started.elapsed().as_secs() >= MAX_RUNTIME_SECONDS
    }

    fn outcome(
        &mut self,
        ok: bool,
        iterations: Option<u32>,
        patch: Option<String>,
        error: Option<String>,
        validation: Option<ValidationReport>,
    ) -> RunOutcome {
        self.metrics.finish(self.started);
        RunOutcome {
            ok,
            iterations,
            patch,
            error,
            metrics: self.metrics.clone(),
            harness_ok: self.harness.ok,
            harness_error: if self.harness.ok {
                None
            } else {
                Some(
                    self.harness
                        .error
                        .clone()
                        .unwrap_or_else(|| "Harness failed".into()),
                )
            },
            compile_result: self.initial_compile.clone(),
            red_result: self.red_result.clone(),
            validation,
            test_suite_verification: self.harness.test_suite_verification.clone(),
        }
    }

    fn error_outcome(&mut self, error: impl Into<String>) -> RunOutcome {
        self.outcome(false, None, None, Some(error.into()), None)
    }

    fn timeout_outcome(&mut self, iterations: u32, where_label: &str) -> RunOutcome {
        tracing::warn!(
            elapsed = self.started.elapsed().as_secs(),
            "wall-clock deadline reached {where_label}, stopping repair"
        );
        // Refuse further work everywhere, including a backoff in flight.
        self.cancel.cancel();
        let patch = self.last_patch.clone();
        self.outcome(
            false,
            Some(iterations),
            patch,
            Some(format!(
                "Timeout: exceeded {MAX_RUNTIME_SECONDS}s runtime limit {where_label}"
            )),
            None,
        )
    }

    async fn chat(
        &mut self,
        label: &str,
        conversation: &Conversation,
        specs: &[ToolSpec],
        tool_choice: ToolChoice,
        phase: Phase,
    ) -> Result<ChatResponse, RetryError> {
        let provider = Arc::clone(&self.provider);
        let model = self.api_model.clone();
        let messages = conversation.as_slice().to_vec();
        let tools = specs.to_vec();
        let response = with_retry(label, &self.cancel, || {
            let provider = Arc::clone(&provider);
            let model = model.clone();
            let messages = messages.clone();
            let tools = tools.clone();
            async move {
                provider
                    .chat(ChatRequest {
                        model: &model,
                        messages: &messages,
                        tools: &tools,
                        tool_choice,
                    })
                    .await
            }
        })
        .await?;
        self.metrics.record_api_call(phase);
        self.metrics.record_usage(phase, response.usage.as_ref());
        Ok(response)
    }

    /// Re-point the adapter-bound tools at `workdir` (after harness, and
    /// again after a workdir recovery).
    fn rebind_workdir_tools(&self, workdir: &Path) {
        if let Some(tool) = &self.tools.check_compile {
            tool.rebind(workdir);
        }
        if let Some(tool) = &self.tools.verify_red {
            tool.rebind(workdir);
        }
        if let Some(tool) = &self.tools.verify_green {
            tool.rebind(workdir);
        }
    }

    async fn run(mut self) -> RunOutcome {
        tracing::info!(
            variant_tdd = self.config.enable_tdd_gate,
            variant_index = self.config.enable_index_retrieval,
            variant_compile = self.config.enable_patch_compile_gate,
            "starting repair loop"
        );
        self.tools.runtime.clear_cache();
        self.started = Instant::now();

        let mut conversation = Conversation::with_system(self.prompts.system.clone());

        // The harness may mutate the Java environment while building the
        // retrieval index; remember what we started with.
        let env_before = JavaEnv::capture();

        tracing::info!("running harness (checkout, export, test)");
        self.harness = self.adapter.harness(&self.request).await;
        if !self.harness.ok {
            let error = self
                .harness
                .error
                .clone()
                .unwrap_or_else(|| "Harness failed".into());
            tracing::error!("harness failed: {error}");
            return self.error_outcome(format!("Harness failed: {error}"));
        }
        tracing::info!(workdir = %self.harness.workdir, "harness completed");

        if self.adapter.needs_java_env_guard() {
            env_before.restore_if_upgraded();
        }

        let workdir = self.workdir();
        self.rebind_workdir_tools(&workdir);

        // RED gate.
        if self.config.enable_tdd_gate && self.config.verify_red_test {
            if let Some(outcome) = self.run_red_gate(&mut conversation).await {
                return outcome;
            }
        }

        conversation.push_user(format!(
            "HARNESS_RESULT:\n{}\n\n{}",
            harness_injection_json(&self.harness),
            self.read_log_hint
        ));

        if self.config.enable_index_retrieval {
            conversation.push_user(index_notice(self.harness.index_path.as_deref()));
        }

        for iteration in 1..=self.max_iters {
            if self.deadline_exceeded() {
                return self.timeout_outcome(iteration - 1, "");
            }
            tracing::info!(iteration, max = self.max_iters, "=== iteration ===");

            let localize_raw = match self.run_localize_phase(&mut conversation, iteration).await {
                Ok(raw) => raw,
                Err(outcome) => return outcome,
            };

            match self.run_patch_phase(&conversation, &localize_raw, iteration).await {
                Some(outcome) => return outcome,
                None => continue,
            }
        }

        tracing::warn!(max = self.max_iters, "reached max iterations without success");
        if let Some(patch) = self.last_patch.clone() {
            self.metrics.score_file_hits(&patch);
        }
        let patch = self.last_patch.clone();
        self.outcome(
            false,
            Some(self.max_iters),
            patch,
            Some("Reached max iterations without successful patch".into()),
            None,
        )
    }

    /// RED gate: compile must succeed and the trigger test must fail for a
    /// real reason before any model call happens. Returns the terminal
    /// outcome when the gate rejects the run.
    async fn run_red_gate(&mut self, conversation: &mut Conversation) -> Option<RunOutcome> {
        tracing::info!("TDD gate: verifying RED test");
        let Some(check_compile) = self.tools.check_compile.clone() else {
            return Some(self.error_outcome("TDD gate enabled but check_compile not available"));
        };
        let compile = check_compile.run().await;
        tracing::info!(
            ok = compile.ok,
            skipped = compile.skipped,
            "pre-RED compile gate result"
        );
        self.initial_compile = Some(compile.clone());
        if !compile.ok {
            tracing::error!(
                "compilation failed before RED verification: {}",
                crate::util::head_chars(compile.summary(), 500)
            );
            return Some(
                self.error_outcome(
                    "Compilation failed before RED test verification; cannot proceed",
                ),
            );
        }

        let Some(verify_red) = self.tools.verify_red.clone() else {
            return Some(self.error_outcome("TDD gate enabled but verify_red function not available"));
        };
        let red = verify_red.run().await;
        self.red_result = Some(red.clone());

        if let Err(reason) = red_gate_verdict(&red) {
            tracing::error!("RED gate rejected the run: {reason}");
            return Some(self.error_outcome(reason));
        }

        tracing::info!(test = %red.test_name, rc = ?red.rc, "RED test verified failing");
        self.metrics.tdd_gate_red_verified = true;
        conversation.push_user(format!(
            "TDD_GATE_RED:\nTest: {}\nRC: {}\nLogfile: {}\n\n\
             IMPORTANT: Read the red.log file (path above) FIRST to get failure details. \
             DO NOT read test.full.log - it is too large and inefficient. The red.log \
             contains the focused failure information you need.",
            red.test_name,
            red.rc.map_or_else(|| "none".into(), |rc| rc.to_string()),
            red.logfile
        ));
        None
    }

    /// One localization phase. Returns the model's final localization text,
    /// or the terminal outcome on fatal errors/timeouts.
    async fn run_localize_phase(
        &mut self,
        conversation: &mut Conversation,
        iteration: u32,
    ) -> Result<String, RunOutcome> {
        tracing::info!("localize phase");
        conversation.push_user(self.prompts.localize.clone());

        let mut tool_call_count: u32 = 0;
        let mut symbol_blocks_read: u32 = 0;
        let mut api_count: u32 = 0;
        let mut predicted_files: Vec<String> = Vec::new();
        let specs = self.tools.localize_specs.clone();
        let workdir = self.workdir();

        let localize_raw = loop {
            if self.deadline_exceeded() {
                return Err(self.timeout_outcome(iteration - 1, "during localization"));
            }

            // Budget walls: force a final answer with tools disabled.
            let forced_notice = if tool_call_count >= MAX_LOCALIZE_TOOL_CALLS {
                Some(
                    "You have reached the maximum number of tool calls. Please return your \
                     localization result now (as JSON)."
                        .to_string(),
                )
            } else if self.config.enable_index_retrieval
                && symbol_blocks_read >= self.config.max_symbol_blocks_per_round
            {
                Some(format!(
                    "You have read {symbol_blocks_read} symbol blocks (limit: {}). Please \
                     return your localization result now.",
                    self.config.max_symbol_blocks_per_round
                ))
            } else if api_count >= self.config.max_localization_api_calls {
                Some(
                    "You have reached the maximum number of API calls in localization phase. \
                     Please return your localization result now (as JSON)."
                        .to_string(),
                )
            } else {
                None
            };

            if let Some(notice) = forced_notice {
                tracing::warn!("localization budget reached, forcing final answer");
                conversation.push_user(notice);
                let response = self
                    .chat(
                        "localize.forced",
                        conversation,
                        &specs,
                        ToolChoice::None,
                        Phase::Localization,
                    )
                    .await
                    .map_err(|e| self.localize_failure(e))?;
                let content = response.text_or_empty().to_string();
                conversation.push_assistant(content.clone());
                break content;
            }

            tracing::info!(
                tool_calls = tool_call_count,
                api_calls = api_count,
                limit = self.config.max_localization_api_calls,
                "calling LLM (localize)"
            );
            api_count += 1;
            let response = self
                .chat(
                    "localize",
                    conversation,
                    &specs,
                    ToolChoice::Auto,
                    Phase::Localization,
                )
                .await
                .map_err(|e| self.localize_failure(e))?;

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                tool_call_count += calls.len() as u32;
                self.metrics.record_tool_calls(Phase::Localization, &calls);
                collect_predicted_files(&calls, &workdir, &mut predicted_files);

                let replies = self.tools.runtime.handle_tool_calls(&calls).await;
                symbol_blocks_read += replies
                    .iter()
                    .filter(|r| r.name == "read_span" || r.name == "symbol_lookup")
                    .count() as u32;
                let assistant_text = response.text_or_empty().to_string();
                if let Err(e) = conversation.push_tool_exchange(assistant_text, calls, replies) {
                    // Runtime always answers one-for-one; treat a mismatch as
                    // a provider protocol bug and end the run.
                    return Err(self.error_outcome(format!("tool exchange failed: {e}")));
                }
                conversation.truncate_if_needed();
                continue;
            }

            let content = response.text_or_empty().to_string();
            conversation.push_assistant(content.clone());
            break content;
        };

        // Best-effort parse of the localization JSON for predicted files.
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(localize_raw.trim()) {
            if let Some(file) = map
                .get("file")
                .or_else(|| map.get("path"))
                .and_then(Value::as_str)
            {
                push_predicted(&mut predicted_files, file);
            }
            if let Some(files) = map.get("files").and_then(Value::as_array) {
                for f in files.iter().filter_map(Value::as_str) {
                    push_predicted(&mut predicted_files, f);
                }
            }
        }
        if !predicted_files.is_empty() {
            tracing::info!(count = predicted_files.len(), "localization predicted files");
        }
        self.metrics.localization_predicted_files = predicted_files;
        Ok(localize_raw)
    }

    fn localize_failure(&mut self, err: RetryError) -> RunOutcome {
        let message = crate::util::head_chars(&err.message, 200).to_string();
        let text = match err.class {
            ErrorClass::FatalQuota => format!("LLM credits/quota exhausted: {message}"),
            ErrorClass::RateLimit => format!(
                "LLM API rate limit (429) after {} retries in localization: {message}",
                err.attempts
            ),
            ErrorClass::Transient => format!(
                "LLM API call failed after {} retries (timeout/server error) in localization: {message}",
                err.attempts
            ),
            ErrorClass::Other => {
                format!("LLM API call failed in localization phase: {message}")
            }
        };
        self.error_outcome(text)
    }

    /// One patch phase. Returns `Some(outcome)` to end the run, `None` to
    /// fall through to the next iteration.
    async fn run_patch_phase(
        &mut self,
        conversation: &Conversation,
        localize_raw: &str,
        iteration: u32,
    ) -> Option<RunOutcome> {
        tracing::info!("patch phase");
        if self.config.enable_tdd_gate && self.config.verify_red_test {
            // False start: entering patching without a confirmed RED failure.
            self.metrics.false_start = Some(!self.metrics.tdd_gate_red_verified);
        }

        let mut patch_conversation = conversation.clone();
        let workdir = self.workdir();

        if let Some(context) = self.derive_patch_context(localize_raw, &workdir) {
            patch_conversation.push_user(context);
        } else {
            tracing::warn!("no patch context could be extracted from localization or logs");
        }
        patch_conversation.push_user(self.prompts.patch.clone());

        let mut feedback = PatchFeedback::new();
        feedback.force_structured_edits = self.force_structured_edits;
        let mut tool_call_count: u32 = 0;
        let mut api_count: u32 = 0;
        let mut compile_fail_count: u32 = 0;
        let mut git_apply_fail_count: u32 = 0;
        let mut consecutive_direct_patches: u32 = 0;
        let specs = self.tools.localize_specs.clone();

        loop {
            if self.deadline_exceeded() {
                return Some(self.timeout_outcome(iteration - 1, "during patch generation"));
            }
            if api_count >= self.config.max_patch_phase_api_calls {
                tracing::warn!(
                    limit = self.config.max_patch_phase_api_calls,
                    "patch phase API budget exhausted"
                );
                return None;
            }
            if consecutive_direct_patches >= self.config.max_consecutive_direct_patches {
                tracing::warn!(
                    streak = consecutive_direct_patches,
                    "consecutive direct patches without progress, stopping patch phase"
                );
                return None;
            }

            tracing::info!(
                tool_calls = tool_call_count,
                api_calls = api_count,
                limit = self.config.max_patch_phase_api_calls,
                "calling LLM (patch)"
            );
            api_count += 1;
            let response = match self
                .chat(
                    "patch",
                    &patch_conversation,
                    &specs,
                    ToolChoice::Auto,
                    Phase::Patch,
                )
                .await
            {
                Ok(response) => response,
                Err(err) if err.class == ErrorClass::FatalQuota => {
                    let message = crate::util::head_chars(&err.message, 200).to_string();
                    return Some(self.outcome(
                        false,
                        Some(iteration),
                        None,
                        Some(format!("LLM credits/quota exhausted: {message}")),
                        None,
                    ));
                }
                Err(err) => {
                    // Patch phase tolerates API failures: try another pass
                    // while the tool budget holds out.
                    tracing::warn!("patch LLM call failed after retries: {}", err.message);
                    if tool_call_count + 1 < self.config.max_tool_calls_per_patch {
                        continue;
                    }
                    return None;
                }
            };

            if response.has_tool_calls() {
                let calls = response.tool_calls.clone();
                tool_call_count += calls.len() as u32;
                consecutive_direct_patches = 0;
                self.metrics.record_tool_calls(Phase::Patch, &calls);
                let replies = self.tools.runtime.handle_tool_calls(&calls).await;
                let assistant_text = response.text_or_empty().to_string();
                if let Err(e) =
                    patch_conversation.push_tool_exchange(assistant_text, calls, replies)
                {
                    return Some(self.error_outcome(format!("tool exchange failed: {e}")));
                }
                patch_conversation.truncate_if_needed();
                continue;
            }

            // The model answered with patch text.
            self.metrics.patch_attempts += 1;
            consecutive_direct_patches += 1;
            let patch_text = clean_patch_text(response.text_or_empty());
            tracing::debug!(
                chars = patch_text.len(),
                streak = consecutive_direct_patches,
                "model returned a direct patch"
            );

            let pass = self
                .try_one_patch(
                    &mut patch_conversation,
                    &mut feedback,
                    patch_text,
                    PatchPassBudget {
                        iteration,
                        tool_call_count,
                        compile_fail_count: &mut compile_fail_count,
                        git_apply_fail_count: &mut git_apply_fail_count,
                        consecutive_direct_patches: &mut consecutive_direct_patches,
                    },
                )
                .await;
            match pass {
                PatchPassOutcome::Continue => continue,
                PatchPassOutcome::Break => return None,
                PatchPassOutcome::Terminal(outcome) => return Some(outcome),
            }
        }
    }

    /// PATCH_CONTEXT derivation: localization JSON, then failing_tests, then
    /// the red.log stack trace.
    fn derive_patch_context(&self, localize_raw: &str, workdir: &Path) -> Option<String> {
        let target: Option<PatchTarget> = target_from_localization(localize_raw)
            .or_else(|| target_from_failing_tests(workdir))
            .or_else(|| target_from_red_log(&self.red_log, workdir));
        let target = target?;
        let snippet = read_context_snippet(workdir, &target, PATCH_CONTEXT_RADIUS)?;
        tracing::info!(file = %target.file, line = ?target.line, "injected patch context");
        Some(format!(
            "PATCH_CONTEXT (use this exact code as ground truth; include proper context \
             lines in your diff hunks):\nTARGET_FILE: {}\nTARGET_LINE: {}\n\n{}\n",
            target.file,
            target
                .line
                .map_or_else(|| "unknown".into(), |l| l.to_string()),
            snippet
        ))
    }

    /// Drive one produced patch through format checks, application, gates
    /// and validation.
    async fn try_one_patch(
        &mut self,
        patch_conversation: &mut Conversation,
        feedback: &mut PatchFeedback,
        mut patch_text: String,
        budget: PatchPassBudget<'_>,
    ) -> PatchPassOutcome {
        let PatchPassBudget {
            iteration,
            tool_call_count,
            compile_fail_count,
            git_apply_fail_count,
            consecutive_direct_patches,
        } = budget;
        let workdir = self.workdir();

        let mut install = |conversation: &mut Conversation,
                           feedback: &mut PatchFeedback,
                           summary: &str,
                           kind: FailureKind,
                           sig: &str| {
            feedback.install_summary(conversation, summary, kind, sig);
            // Feedback counts as progress for the direct-patch loop detector.
            *consecutive_direct_patches = 0;
        };

        if patch_text.is_empty() {
            tracing::warn!("model returned an empty patch");
            install(
                patch_conversation,
                feedback,
                "EMPTY_PATCH: Your last response contained no patch. Output either a valid \
                 unified diff (starting with 'diff --git') or structured edits JSON.",
                FailureKind::FormatError,
                "empty_patch",
            );
            if feedback.should_stop_due_to_repeat() {
                return PatchPassOutcome::Break;
            }
            return PatchPassOutcome::Continue;
        }

        let format = detect_patch_format(&patch_text);
        let is_json_format = !matches!(format, PatchFormat::UnifiedDiff);

        if feedback.force_structured_edits && !is_json_format {
            install(
                patch_conversation,
                feedback,
                FORCE_STRUCTURED_EDITS_FEEDBACK,
                FailureKind::FormatError,
                "expected_structured_edits_json",
            );
            if feedback.should_stop_due_to_repeat() {
                return PatchPassOutcome::Break;
            }
            return PatchPassOutcome::Continue;
        }

        let mut patch_already_applied = false;

        match format {
            PatchFormat::StructuredInvalid(reason) => {
                tracing::warn!("structured edits JSON of unusable shape: {reason}");
                install(
                    patch_conversation,
                    feedback,
                    &format!(
                        "STRUCTURED_EDITS_PARSE_FAILED:\n{reason}\n\nPlease output a valid \
                         unified diff (starting with 'diff --git') or well-formed structured \
                         edits JSON."
                    ),
                    FailureKind::FormatError,
                    &reason,
                );
                if feedback.should_stop_due_to_repeat() {
                    return PatchPassOutcome::Break;
                }
                return PatchPassOutcome::Continue;
            }
            PatchFormat::Structured(candidates) => {
                tracing::info!(count = candidates.len(), "trying structured-edits candidates");
                let mut compile_errors: Vec<Value> = Vec::new();
                let mut applied = false;

                for candidate in &candidates {
                    tracing::info!(
                        id = candidate.id,
                        strategy = %candidate.strategy,
                        "applying patch candidate"
                    );
                    let apply_result = apply_file_edits(&workdir, &candidate.edits);
                    if apply_result.get("ok").and_then(Value::as_bool) != Some(true) {
                        tracing::warn!(
                            id = candidate.id,
                            "candidate failed to apply: {}",
                            apply_result["error"].as_str().unwrap_or("unknown error")
                        );
                        continue;
                    }
                    let applied_files = apply_result
                        .get("applied_files")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len);
                    if applied_files == 0 || apply_result.get("warning").is_some() {
                        tracing::warn!(id = candidate.id, "candidate modified no files");
                        reset_to_head(&workdir).await;
                        continue;
                    }
                    patch_already_applied = true;

                    let diff_result = get_git_diff(&workdir).await;
                    let has_changes = diff_result.get("ok").and_then(Value::as_bool)
                        == Some(true)
                        && diff_result.get("has_changes").and_then(Value::as_bool) == Some(true);
                    if !has_changes {
                        tracing::warn!(id = candidate.id, "no tree changes after applying edits");
                        reset_to_head(&workdir).await;
                        patch_already_applied = false;
                        continue;
                    }
                    patch_text = diff_result["diff"].as_str().unwrap_or_default().to_string();
                    applied = true;

                    // Per-candidate compile gate.
                    if self.config.enable_patch_compile_gate && self.config.use_compile_gate {
                        if let Some(check_compile) = self.tools.check_compile.clone() {
                            self.metrics.compile_attempt_count += 1;
                            let report = check_compile.run().await;
                            if report.ok {
                                self.metrics.compile_success_count += 1;
                                tracing::info!(id = candidate.id, "candidate compiles");
                                break;
                            }
                            tracing::warn!(
                                id = candidate.id,
                                rc = ?report.rc,
                                "candidate failed to compile"
                            );
                            self.metrics.compile_failures += 1;
                            compile_errors.push(serde_json::json!({
                                "candidate_id": candidate.id,
                                "strategy": candidate.strategy,
                                "error": crate::util::head_chars(report.summary(), 1000),
                            }));
                            reset_to_head(&workdir).await;
                            patch_already_applied = false;
                            applied = false;
                            continue;
                        }
                    }
                    break;
                }

                if !applied {
                    tracing::warn!(count = candidates.len(), "all patch candidates failed");
                    if !compile_errors.is_empty() {
                        *compile_fail_count += 1;
                        if *compile_fail_count >= self.config.max_compile_failures {
                            tracing::warn!("max compile failures reached, leaving patch phase");
                            return PatchPassOutcome::Break;
                        }
                        if tool_call_count < self.config.max_tool_calls_per_patch {
                            let top: Vec<&Value> = compile_errors.iter().take(2).collect();
                            let err_lines: Vec<String> = top
                                .iter()
                                .map(|e| {
                                    format!(
                                        "Candidate {} ({}):\n{}",
                                        e["candidate_id"],
                                        e["strategy"].as_str().unwrap_or("unknown"),
                                        crate::util::head_chars(
                                            e["error"].as_str().unwrap_or(""),
                                            500
                                        )
                                    )
                                })
                                .collect();
                            let summary = format!(
                                "COMPILATION_ERROR_FEEDBACK:\nAll {} patch candidates failed \
                                 to compile.\n\n{}\n\nPlease regenerate the patch focusing on \
                                 fixing the compilation error(s).",
                                candidates.len(),
                                err_lines.join("\n\n")
                            );
                            let sig = serde_json::to_string(&top).unwrap_or_default();
                            install(
                                patch_conversation,
                                feedback,
                                &summary,
                                FailureKind::CompileError,
                                &sig,
                            );
                            if feedback.should_stop_due_to_repeat() {
                                return PatchPassOutcome::Break;
                            }
                            return PatchPassOutcome::Continue;
                        }
                        return PatchPassOutcome::Break;
                    }
                    install(
                        patch_conversation,
                        feedback,
                        &format!(
                            "ALL_PATCH_CANDIDATES_FAILED:\nTried {} strategies, but none \
                             worked.\n\nPlease regenerate the patch with a different approach \
                             and ensure it actually changes the target code.",
                            candidates.len()
                        ),
                        FailureKind::CandidateError,
                        &format!("candidates_failed:{}", candidates.len()),
                    );
                    if tool_call_count < self.config.max_tool_calls_per_patch {
                        if feedback.should_stop_due_to_repeat() {
                            return PatchPassOutcome::Break;
                        }
                        return PatchPassOutcome::Continue;
                    }
                    return PatchPassOutcome::Break;
                }
            }
            PatchFormat::UnifiedDiff => {
                if self.config.use_unified_diff {
                    if let Err(issue) = validate_unified_diff(&patch_text) {
                        let detail = issue.detail().to_string();
                        tracing::warn!("patch failed unified-diff validation: {detail}");
                        let summary = if !feedback.force_structured_edits
                            && feedback.repeated_count() >= 2
                        {
                            feedback.force_structured_edits = true;
                            self.force_structured_edits = true;
                            format!(
                                "PATCH_FORMAT_ERROR:\n{detail}\n\nYou have repeatedly produced \
                                 an invalid unified diff.\nSwitch output format NOW to \
                                 STRUCTURED EDITS JSON (no markdown):\n\
                                 {STRUCTURED_EDITS_EXAMPLE}\n\nRules:\n\
                                 - Output ONLY JSON (no markdown, no explanations)\n\
                                 - Use exact line numbers; do not use '...'\n"
                            )
                        } else {
                            format!(
                                "PATCH_FORMAT_ERROR:\n{detail}\n\nRules:\n\
                                 - Output ONLY unified diff (no markdown, no explanations)\n\
                                 - Do NOT use '...' placeholders\n\
                                 - Ensure @@ hunk header counts match the hunk body\n\
                                 - Ensure the patch ends with a newline\n"
                            )
                        };
                        install(
                            patch_conversation,
                            feedback,
                            &summary,
                            FailureKind::FormatError,
                            &detail,
                        );
                        if feedback.should_stop_due_to_repeat() {
                            return PatchPassOutcome::Break;
                        }
                        return PatchPassOutcome::Continue;
                    }
                }
            }
        }

        // Apply the unified diff (unless apply_edits already mutated the tree).
        self.metrics.apply_attempt_count += 1;
        let apply_report = if patch_already_applied {
            tracing::info!("patch already applied via structured edits, skipping git apply");
            serde_json::json!({"ok": true, "message": "Patch already applied via structured edits"})
        } else {
            // Validation guarantees a diff --git header exists; normalize to it.
            if !patch_text.trim_start().starts_with("diff --git") {
                match patch_text.find("diff --git") {
                    Some(idx) => patch_text = patch_text[idx..].to_string(),
                    None => {
                        tracing::error!("no 'diff --git' in patch text after validation");
                        return PatchPassOutcome::Break;
                    }
                }
            }
            if !workdir.exists() {
                tracing::error!(workdir = %workdir.display(), "workdir disappeared, attempting re-checkout");
                if !self.recover_workdir(&workdir).await {
                    return PatchPassOutcome::Terminal(self.outcome(
                        false,
                        Some(iteration),
                        None,
                        Some(format!(
                            "Workdir not found: {} (may have been deleted during execution)",
                            workdir.display()
                        )),
                        None,
                    ));
                }
            }
            apply_unified_diff(&workdir, &patch_text).await
        };

        if apply_report.get("ok").and_then(Value::as_bool) != Some(true) {
            *git_apply_fail_count += 1;
            self.metrics.git_apply_failures += 1;
            let error = apply_report["error"].as_str().unwrap_or("unknown error");
            let stderr = apply_report["stderr"].as_str().unwrap_or("");
            tracing::warn!(
                failures = *git_apply_fail_count,
                limit = self.config.max_git_apply_failures,
                "patch apply failed: {error}"
            );
            if *git_apply_fail_count >= self.config.max_git_apply_failures {
                tracing::warn!("too many consecutive git apply failures, leaving patch phase");
                return PatchPassOutcome::Break;
            }
            let check_failed =
                apply_report.get("check_failed").and_then(Value::as_bool) == Some(true)
                    || error.to_lowercase().contains("patch check failed");
            let (kind, summary) = classify_apply_failure(error, stderr, check_failed);
            let sig = format!("{error}\n{stderr}");
            install(patch_conversation, feedback, &summary, kind, &sig);
            if tool_call_count < self.config.max_tool_calls_per_patch {
                if feedback.should_stop_due_to_repeat() {
                    return PatchPassOutcome::Break;
                }
                return PatchPassOutcome::Continue;
            }
            return PatchPassOutcome::Break;
        }
        *git_apply_fail_count = 0;
        self.metrics.apply_success_count += 1;

        // Standalone compile gate for the unified-diff path.
        if !patch_already_applied
            && self.config.enable_patch_compile_gate
            && self.config.use_compile_gate
        {
            if let Some(check_compile) = self.tools.check_compile.clone() {
                if !workdir.exists() && !self.recover_workdir(&workdir).await {
                    return PatchPassOutcome::Terminal(self.outcome(
                        false,
                        Some(iteration),
                        None,
                        Some(format!(
                            "Workdir not found during compilation: {}",
                            workdir.display()
                        )),
                        None,
                    ));
                }
                tracing::info!("compile gate: checking compilation");
                self.metrics.compile_attempt_count += 1;
                let report = check_compile.run().await;
                if report.ok {
                    self.metrics.compile_success_count += 1;
                } else {
                    let summary_text = crate::util::head_chars(report.summary(), 800).to_string();
                    tracing::warn!("compile gate failed: {}", crate::util::head_chars(&summary_text, 300));
                    reset_to_head(&workdir).await;
                    *compile_fail_count += 1;
                    self.metrics.compile_failures += 1;
                    if *compile_fail_count >= self.config.max_compile_failures {
                        tracing::warn!("max compile failures reached, leaving patch phase");
                        return PatchPassOutcome::Break;
                    }
                    if tool_call_count < self.config.max_tool_calls_per_patch {
                        let feedback_text = format!(
                            "COMPILATION_ERROR_FEEDBACK:\nThe patch failed to compile. Key \
                             error (truncated):\n\n{summary_text}\n\nPlease regenerate the \
                             patch. Focus on fixing the compile error (imports, signatures, \
                             syntax)."
                        );
                        let sig = if summary_text.is_empty() {
                            "compile_failed".to_string()
                        } else {
                            summary_text
                        };
                        install(
                            patch_conversation,
                            feedback,
                            &feedback_text,
                            FailureKind::CompileError,
                            &sig,
                        );
                        if feedback.should_stop_due_to_repeat() {
                            return PatchPassOutcome::Break;
                        }
                        return PatchPassOutcome::Continue;
                    }
                    return PatchPassOutcome::Break;
                }
            }
        }

        // Canonical diff: report what the tree actually changed.
        if self.config.enable_patch_compile_gate && self.config.use_canonical_diff {
            let diff_result = get_git_diff(&workdir).await;
            if diff_result.get("ok").and_then(Value::as_bool) == Some(true)
                && diff_result.get("has_changes").and_then(Value::as_bool) == Some(true)
            {
                patch_text = diff_result["diff"].as_str().unwrap_or_default().to_string();
                tracing::info!(chars = patch_text.len(), "canonical diff generated");
            }
        }

        self.last_patch = Some(patch_text.clone());

        // GREEN gate.
        if self.config.enable_tdd_gate && self.config.verify_green_test {
            if self.metrics.early_rejection.is_none() {
                self.metrics.early_rejection = Some(false);
            }
            if let Some(verify_green) = self.tools.verify_green.clone() {
                tracing::info!("TDD gate: verifying GREEN test");
                let green = verify_green.run().await;
                if self.deadline_exceeded() {
                    return PatchPassOutcome::Terminal(
                        self.timeout_outcome(iteration - 1, "after GREEN test execution"),
                    );
                }
                if green.rc != Some(0) {
                    tracing::warn!(rc = ?green.rc, "GREEN test failed, rejecting patch early");
                    self.metrics.early_rejection = Some(true);
                    let summary = format!(
                        "GREEN_TEST_FAILED:\nrc={}\ntest_name={}\nlogfile={}\n\nThe patch \
                         avoided RED failure but did not make the test pass.\nRegenerate a new \
                         patch (different approach) to make GREEN pass.\n",
                        green.rc.map_or_else(|| "none".into(), |rc| rc.to_string()),
                        green.test_name,
                        green.logfile
                    );
                    let sig = format!("rc={:?};test={}", green.rc, green.test_name);
                    install(
                        patch_conversation,
                        feedback,
                        &summary,
                        FailureKind::GreenFailed,
                        &sig,
                    );
                    reset_to_head(&workdir).await;
                    return PatchPassOutcome::Continue;
                }
                tracing::info!("GREEN test passed");
                self.metrics.tdd_gate_green_verified = true;
            }
        }

        // Full validation.
        tracing::info!("validating patch (full test suite)");
        let validation = match self.adapter.validate(&self.request).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!("validation raised an exception: {err:#}");
                ValidationReport::failed_with(format!("Validation exception: {err:#}"))
            }
        };
        if self.deadline_exceeded() {
            return PatchPassOutcome::Terminal(
                self.timeout_outcome(iteration - 1, "after full test validation"),
            );
        }

        if validation.passed {
            tracing::info!("patch passed validation");
            let patch = self.last_patch.clone().unwrap_or_default();
            self.metrics.score_file_hits(&patch);
            return PatchPassOutcome::Terminal(self.outcome(
                true,
                Some(iteration),
                Some(patch),
                None,
                Some(validation),
            ));
        }

        self.metrics.validation_failures += 1;
        tracing::warn!("patch failed validation, trying next attempt in same iteration");
        let summary = build_validation_feedback(&validation);
        let sig_source =
            serde_json::to_string(&validation).unwrap_or_else(|_| "validation_failed".into());
        let sig = crate::util::head_chars(&sig_source, 500).to_string();
        install(
            patch_conversation,
            feedback,
            &summary,
            FailureKind::ValidationFailed,
            &sig,
        );
        reset_to_head(&workdir).await;
        PatchPassOutcome::Continue
    }

    /// One re-checkout attempt when the workdir vanished mid-run. Rebinds
    /// the adapter tools on success.
    async fn recover_workdir(&self, workdir: &Path) -> bool {
        let report = self
            .adapter
            .checkout(&self.request.pid, self.request.bid, workdir)
            .await;
        if report.ok {
            tracing::info!(workdir = %workdir.display(), "re-checked out workdir");
            self.rebind_workdir_tools(workdir);
            true
        } else {
            tracing::error!(
                "failed to re-checkout workdir: {}",
                crate::util::head_chars(&report.stderr, 300)
            );
            false
        }
    }
}

struct PatchPassBudget<'a> {
    iteration: u32,
    tool_call_count: u32,
    compile_fail_count: &'a mut u32,
    git_apply_fail_count: &'a mut u32,
    consecutive_direct_patches: &'a mut u32,
}

const STRUCTURED_EDITS_EXAMPLE: &str = r#"[
  {
    "path": "relative/path/to/file.java",
    "ops": [
      {"type": "replace", "start_line": 10, "end_line": 12, "text": "fixed code\n"}
    ]
  }
]"#;

const FORCE_STRUCTURED_EDITS_FEEDBACK: &str = "PATCH_FORMAT_ERROR:\n\
You MUST output STRUCTURED EDITS JSON now. Do NOT output unified diff.\n\n\
Output ONLY JSON (no markdown):\n\
[\n\
  {\n\
    \"path\": \"relative/path/to/file.java\",\n\
    \"ops\": [\n\
      {\"type\": \"replace\", \"start_line\": 10, \"end_line\": 12, \"text\": \"fixed code\\n\"}\n\
    ]\n\
  }\n\
]\n\n\
Rules:\n\
- Output ONLY JSON\n\
- No markdown fences, no explanations\n\
- Use exact line numbers from the PATCH_CONTEXT snippet\n";

/// Pre-harness Java environment, restored when index building upgraded the
/// JVM past what Defects4J tolerates.
struct JavaEnv {
    java_home: Option<String>,
    path: Option<String>,
}

impl JavaEnv {
    fn capture() -> Self {
        Self {
            java_home: std::env::var("JAVA_HOME").ok(),
            path: std::env::var("PATH").ok(),
        }
    }

    /// Defects4J needs Java 8/11; index builders may leave JAVA_HOME on 17+.
    /// Restore the captured environment only in that case. Idempotent.
    fn restore_if_upgraded(&self) {
        let Ok(current) = std::env::var("JAVA_HOME") else {
            return;
        };
        let upgraded = ["java-17", "java-21", "java-1.17", "java-1.21"]
            .iter()
            .any(|v| current.contains(v));
        if !upgraded {
            return;
        }
        if let Some(home) = &self.java_home {
            if Path::new(home).exists() {
                std::env::set_var("JAVA_HOME", home);
                if let Some(path) = &self.path {
                    std::env::set_var("PATH", path);
                }
                tracing::info!(java_home = %home, "restored pre-harness Java environment");
            }
        }
    }
}

/// The harness JSON handed to the model, head+tail capped when oversized.
fn harness_injection_json(harness: &HarnessInfo) -> String {
    let json = serde_json::to_string(harness).unwrap_or_else(|_| "{}".into());
    if json.chars().count() <= HARNESS_JSON_CAP {
        return json;
    }
    tracing::warn!(chars = json.len(), "truncating oversized harness JSON");
    format!(
        "{}\n\n[... truncated ...]\n\n{}",
        crate::util::head_chars(&json, HARNESS_JSON_HEAD),
        crate::util::tail_chars(&json, HARNESS_JSON_TAIL)
    )
}

/// Retrieval-index notice injected when the index gate is active.
fn index_notice(index_path: Option<&str>) -> String {
    if let Some(path) = index_path {
        if !path.is_empty() && Path::new(path).exists() {
            return format!(
                "RETRIEVAL_INDEX: {path}\n\nYou can use symbol_lookup, find_references, and \
                 read_span tools with this index."
            );
        }
    }
    "RETRIEVAL_INDEX_UNAVAILABLE: The retrieval index was not successfully built. Please use \
     grep/read_file tools for localization instead."
        .to_string()
}

/// RED gate verdict: only a genuinely executed, non-{0,2,4} exit proves the
/// bug reproduces.
fn red_gate_verdict(run: &TestRun) -> Result<(), String> {
    if run.is_infrastructure_failure() {
        return Err("RED test execution failed; cannot proceed".into());
    }
    match run.rc {
        Some(0) => Err("RED test did not fail; cannot proceed".into()),
        Some(rc @ (2 | 4)) => Err(format!(
            "RED test rc={rc} (pytest config or no tests collected); cannot proceed"
        )),
        _ => Ok(()),
    }
}

/// Classify a git-apply failure and build its feedback. Only explicit parse
/// markers count as format errors; everything else is a context mismatch.
fn classify_apply_failure(
    error: &str,
    stderr: &str,
    check_failed: bool,
) -> (FailureKind, String) {
    const FORMAT_MARKERS: &[&str] = &[
        "corrupt patch",
        "invalid patch",
        "patch fragment without header",
        "unrecognized input",
        "malformed patch",
    ];
    let combined = format!("{error} {stderr}").to_lowercase();
    let is_format = check_failed && FORMAT_MARKERS.iter().any(|m| combined.contains(m));

    if is_format {
        let mut feedback = format!(
            "PATCH_FORMAT_ERROR: The patch format is invalid or corrupt.\n\nError: {error}"
        );
        if !stderr.is_empty() {
            feedback.push_str(&format!(
                "\n\nGit apply stderr:\n{}",
                crate::util::head_chars(stderr, 500)
            ));
        }
        feedback.push_str(
            "\n\nPlease output ONLY a valid unified diff patch starting with 'diff --git', with:\n\
             - No explanation text before or after the patch\n\
             - No markdown code blocks\n\
             - Correct line numbers in @@ lines\n\
             - Complete patch (all lines declared in @@ must be present)\n\n\
             Ensure the patch format matches exactly the example in the prompt.",
        );
        (FailureKind::FormatError, feedback)
    } else if check_failed {
        let mut feedback = format!(
            "PATCH_APPLY_FAILED: The patch cannot be applied (context mismatch / wrong file / \
             wrong hunk location).\n\nError: {error}"
        );
        if !stderr.is_empty() {
            feedback.push_str(&format!(
                "\n\nGit apply stderr:\n{}",
                crate::util::head_chars(stderr, 500)
            ));
        }
        feedback.push_str(
            "\n\nPlease:\n\
             1. Re-read the TARGET_FILE snippet in PATCH_CONTEXT (above) and use it as ground truth\n\
             2. Make sure your diff modifies lines that actually exist in that snippet\n\
             3. Include enough context lines (leading space) so git can locate the hunk\n\
             4. Regenerate the patch with correct file path and matching context",
        );
        (FailureKind::ApplyError, feedback)
    } else {
        (
            FailureKind::ApplyError,
            format!(
                "PATCH_APPLY_FAILED:\n{error}\n\nPlease regenerate the patch with correct file \
                 path and matching context."
            ),
        )
    }
}

/// Validation feedback preferring adapter-structured fields over raw JSON.
fn build_validation_feedback(report: &ValidationReport) -> String {
    let mut parts = vec!["VALIDATION_FAILED:\nPatch did not pass all tests.\n".to_string()];
    let detail = &report.detail;

    if let Some(rc) = detail.get("rc") {
        parts.push(format!("Return code: {rc}\n"));
        let stderr = detail.get("stderr").and_then(Value::as_str).unwrap_or("");
        let stdout = detail.get("stdout").and_then(Value::as_str).unwrap_or("");
        if !stderr.trim().is_empty() {
            parts.push(format!(
                "Error output:\n{}\n",
                crate::util::tail_chars(stderr.trim(), 1500)
            ));
        } else if !stdout.trim().is_empty() {
            parts.push(format!(
                "Output:\n{}\n",
                crate::util::tail_chars(stdout.trim(), 1500)
            ));
        }
        if let Some(instance) = detail.get("instance_id") {
            parts.push(format!("Instance: {instance}\n"));
        }
    } else if detail.contains_key("test_full") || detail.contains_key("test_trigger") {
        if let Some(full) = detail.get("test_full").and_then(Value::as_object) {
            parts.push(format!(
                "Full test suite: test_rc={}, rc={}\n",
                full.get("test_rc").unwrap_or(&Value::Null),
                full.get("rc").unwrap_or(&Value::Null)
            ));
            push_stream_section(&mut parts, full, "Full test stderr", "Full test output");
            if let Some(logfile) = full.get("logfile").and_then(Value::as_str) {
                parts.push(format!("Full test log: {logfile}\n"));
            }
        }
        if let Some(trigger) = detail.get("test_trigger").and_then(Value::as_object) {
            parts.push(format!(
                "Trigger tests: passed={}, rc={}\n",
                trigger.get("passed").unwrap_or(&Value::Null),
                trigger.get("rc").unwrap_or(&Value::Null)
            ));
            push_stream_section(&mut parts, trigger, "Trigger test stderr", "Trigger test output");
            if let Some(logfile) = trigger.get("logfile").and_then(Value::as_str) {
                parts.push(format!("Trigger test log: {logfile}\n"));
            }
        }
    } else {
        let dump = serde_json::to_string(report).unwrap_or_default();
        parts.push(format!(
            "Validation result:\n{}\n",
            crate::util::head_chars(&dump, 800)
        ));
    }

    parts.push("\nPlease regenerate a different patch that passes all tests.".to_string());
    parts.concat()
}

fn push_stream_section(
    parts: &mut Vec<String>,
    obj: &serde_json::Map<String, Value>,
    stderr_label: &str,
    stdout_label: &str,
) {
    let stderr = obj.get("stderr").and_then(Value::as_str).unwrap_or("");
    let stdout = obj.get("stdout").and_then(Value::as_str).unwrap_or("");
    if !stderr.trim().is_empty() {
        parts.push(format!(
            "{stderr_label}:\n{}\n",
            crate::util::tail_chars(stderr.trim(), 1500)
        ));
    } else if !stdout.trim().is_empty() {
        parts.push(format!(
            "{stdout_label}:\n{}\n",
            crate::util::tail_chars(stdout.trim(), 1500)
        ));
    }
}

/// Record file paths touched by localization tool calls, normalized off the
/// workdir prefix, restricted to code files, deduplicated in order.
fn collect_predicted_files(calls: &[ToolCall], workdir: &Path, predicted: &mut Vec<String>) {
    const PATH_TOOLS: &[&str] = &["read_file", "read_span", "grep", "search_in_files"];
    let workdir_str = workdir.to_string_lossy();
    for call in calls {
        if !PATH_TOOLS.contains(&call.name.as_str()) {
            continue;
        }
        let Ok(args) = serde_json::from_str::<Value>(&call.arguments) else {
            continue;
        };
        let Some(raw) = args
            .get("path")
            .or_else(|| args.get("file"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let mut path = raw.to_string();
        if !workdir_str.is_empty() && path.starts_with(workdir_str.as_ref()) {
            path = path[workdir_str.len()..].trim_start_matches('/').to_string();
        }
        push_predicted(predicted, &path);
    }
}

fn push_predicted(predicted: &mut Vec<String>, path: &str) {
    if !path.is_empty() && is_code_file(path) && !predicted.iter().any(|p| p == path) {
        predicted.push(path.to_string());
    }
}
