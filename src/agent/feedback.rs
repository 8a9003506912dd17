//! Patch failure feedback.
//!
//! The patch history carries at most one `PATCH_FAIL_SUMMARY` user message:
//! installing a new one removes the previous one. The controller also tracks
//! consecutive identical failures (matched on kind plus the first 200
//! signature characters) and decides when the loop should stop grinding on
//! the same error.

use crate::agent::conversation::Conversation;
use serde::Serialize;
use std::fmt;

const SUMMARY_PREFIX: &str = "PATCH_FAIL_SUMMARY:";
const SIGNATURE_PREFIX_LEN: usize = 200;

/// Failure classes the patch loop can report back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FormatError,
    ApplyError,
    CompileError,
    CandidateError,
    ValidationFailed,
    GreenFailed,
    EmptyPatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::FormatError => "format_error",
            FailureKind::ApplyError => "apply_error",
            FailureKind::CompileError => "compile_error",
            FailureKind::CandidateError => "candidate_error",
            FailureKind::ValidationFailed => "validation_failed",
            FailureKind::GreenFailed => "green_failed",
            FailureKind::EmptyPatch => "empty_patch",
        };
        f.write_str(name)
    }
}

/// Stateful feedback policy for one patch phase.
#[derive(Debug, Default)]
pub struct PatchFeedback {
    last_kind: Option<FailureKind>,
    last_signature: Option<String>,
    repeated_count: u32,
    /// Once set, non-JSON patch output is rejected for the rest of the run.
    pub force_structured_edits: bool,
}

impl PatchFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repeated_count(&self) -> u32 {
        self.repeated_count
    }

    /// Install `summary` as the single failure-summary message in
    /// `conversation`, replacing any previous one, and update the repeat
    /// tracking. Returns the repeat count for this `(kind, signature)`.
    ///
    /// Installing feedback counts as progress, so the caller must reset its
    /// consecutive-direct-patch counter; the returned count supports that.
    pub fn install_summary(
        &mut self,
        conversation: &mut Conversation,
        summary: &str,
        kind: FailureKind,
        signature: &str,
    ) -> u32 {
        let sig_short: String = crate::util::head_chars(signature, SIGNATURE_PREFIX_LEN).to_string();
        if self.last_kind == Some(kind) && self.last_signature.as_deref() == Some(&sig_short) {
            self.repeated_count += 1;
        } else {
            self.repeated_count = 1;
            self.last_kind = Some(kind);
            self.last_signature = Some(sig_short);
        }

        conversation.retain_user(|content| !content.starts_with(SUMMARY_PREFIX));
        conversation.push_user(format!(
            "{SUMMARY_PREFIX}\ntype={kind}\nrepeat={}\n\n{}",
            self.repeated_count,
            summary.trim()
        ));
        self.repeated_count
    }

    /// Stop once the same failure repeats. Format errors are often
    /// recoverable, so they get four strikes; everything else gets two.
    pub fn should_stop_due_to_repeat(&self) -> bool {
        match self.last_kind {
            Some(FailureKind::FormatError) => self.repeated_count >= 4,
            Some(_) => self.repeated_count >= 2,
            None => false,
        }
    }
}
