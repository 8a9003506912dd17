//! Run telemetry.
//!
//! Counters are plain integers bumped inline by the loop; nothing here is
//! shared across threads. API calls count only on success so retries never
//! double-count, and token totals accrue both globally and per phase.

use crate::agent::patching::{extract_files_from_patch, file_hit_at_k};
use crate::providers::{TokenUsage, ToolCall};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Localization,
    Patch,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseMetrics {
    pub api_calls: u64,
    pub tool_calls: u64,
    pub total_tokens: u64,
    pub tool_calls_by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub total_api_calls: u64,
    pub total_tool_calls: u64,
    pub total_tokens: u64,
    pub localization: PhaseMetrics,
    pub patch: PhaseMetrics,
    pub total_tool_calls_by_type: BTreeMap<String, u64>,
    pub compile_failures: u64,
    pub git_apply_failures: u64,
    pub validation_failures: u64,
    pub patch_attempts: u64,
    pub apply_attempt_count: u64,
    pub apply_success_count: u64,
    pub compile_attempt_count: u64,
    pub compile_success_count: u64,
    pub tdd_gate_red_verified: bool,
    pub tdd_gate_green_verified: bool,
    /// Entered the patch phase without a verified RED failure. Only
    /// populated when the TDD gate is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_start: Option<bool>,
    /// GREEN failed and full validation was skipped for that attempt. Only
    /// populated when GREEN verification is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_rejection: Option<bool>,
    pub runtime_seconds: f64,
    pub localization_predicted_files: Vec<String>,
    pub actual_modified_files: Vec<String>,
    pub file_hit_at_1: bool,
    pub file_hit_at_3: bool,
}

impl Metrics {
    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseMetrics {
        match phase {
            Phase::Localization => &mut self.localization,
            Phase::Patch => &mut self.patch,
        }
    }

    /// Count one successful API call for `phase`.
    pub fn record_api_call(&mut self, phase: Phase) {
        self.total_api_calls += 1;
        self.phase_mut(phase).api_calls += 1;
    }

    /// Add a response's token usage to the global and phase totals.
    pub fn record_usage(&mut self, phase: Phase, usage: Option<&TokenUsage>) {
        let Some(total) = usage.and_then(TokenUsage::total) else {
            return;
        };
        self.total_tokens += total;
        self.phase_mut(phase).total_tokens += total;
    }

    /// Count a batch of tool calls, by phase and by tool name.
    pub fn record_tool_calls(&mut self, phase: Phase, calls: &[ToolCall]) {
        self.total_tool_calls += calls.len() as u64;
        let phase_metrics = self.phase_mut(phase);
        phase_metrics.tool_calls += calls.len() as u64;
        for call in calls {
            *phase_metrics
                .tool_calls_by_type
                .entry(call.name.clone())
                .or_insert(0) += 1;
        }
        for call in calls {
            *self
                .total_tool_calls_by_type
                .entry(call.name.clone())
                .or_insert(0) += 1;
        }
    }

    /// Stamp the wall-clock runtime. Called on every exit path.
    pub fn finish(&mut self, started: Instant) {
        self.runtime_seconds = started.elapsed().as_secs_f64();
    }

    /// Compute Hit@k from the accepted (or last) patch. Only code files
    /// participate on both sides.
    pub fn score_file_hits(&mut self, patch_text: &str) {
        self.actual_modified_files = extract_files_from_patch(patch_text);
        self.file_hit_at_1 = file_hit_at_k(
            &self.localization_predicted_files,
            &self.actual_modified_files,
            1,
        );
        self.file_hit_at_3 = file_hit_at_k(
            &self.localization_predicted_files,
            &self.actual_modified_files,
            3,
        );
    }
}
