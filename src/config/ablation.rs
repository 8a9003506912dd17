//! Feature gates and budgets for a repair run.
//!
//! Every run is described by one flat [`AblationConfig`]: three coarse module
//! gates with their sub-flags, plus the budgets that bound API usage, tool
//! usage, and failure retries. Named variants (`G0`..`G3`, `G5`/`TRACE`)
//! expand to fixed bit patterns so the same variant name always produces
//! identical settings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Configuration for one repair-loop invocation.
///
/// Loaded from a variant's `config.json`; unknown keys are ignored so older
/// variant files keep working across releases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AblationConfig {
    // Module gates
    pub enable_tdd_gate: bool,
    pub enable_index_retrieval: bool,
    pub enable_patch_compile_gate: bool,

    // Baseline behavior (always on)
    pub use_grep_read_file: bool,
    pub use_unified_diff: bool,
    pub use_full_test_validation: bool,

    // TDD gate sub-flags
    pub verify_red_test: bool,
    pub verify_green_test: bool,

    // Index retrieval sub-flags
    pub use_symbol_lookup: bool,
    pub use_find_references: bool,
    pub use_read_span: bool,
    pub max_symbol_blocks_per_round: u32,

    // Patch/compile gate sub-flags
    pub use_git_apply_check: bool,
    pub use_canonical_diff: bool,
    pub use_compile_gate: bool,

    // Budgets
    pub max_localization_api_calls: u32,
    pub max_patch_phase_api_calls: u32,
    pub max_tool_calls_per_patch: u32,
    pub max_consecutive_direct_patches: u32,
    pub max_git_apply_failures: u32,
    pub max_compile_failures: u32,
}

impl Default for AblationConfig {
    fn default() -> Self {
        Self {
            enable_tdd_gate: false,
            enable_index_retrieval: false,
            enable_patch_compile_gate: false,
            use_grep_read_file: true,
            use_unified_diff: true,
            use_full_test_validation: true,
            verify_red_test: false,
            verify_green_test: false,
            use_symbol_lookup: false,
            use_find_references: false,
            use_read_span: false,
            max_symbol_blocks_per_round: 10,
            use_git_apply_check: false,
            use_canonical_diff: false,
            use_compile_gate: false,
            max_localization_api_calls: 36,
            max_patch_phase_api_calls: 50,
            max_tool_calls_per_patch: 4,
            max_consecutive_direct_patches: 5,
            max_git_apply_failures: 5,
            max_compile_failures: 5,
        }
    }
}

impl AblationConfig {
    /// Expand a variant name into its preset configuration.
    ///
    /// `G5` and `TRACE` are the same full-system preset under two names.
    pub fn from_variant(variant: &str) -> Result<Self> {
        let base = Self::default();
        match variant.to_ascii_uppercase().as_str() {
            "G0" => Ok(base),
            "G1" => Ok(Self {
                enable_tdd_gate: true,
                verify_red_test: true,
                verify_green_test: true,
                ..base
            }),
            "G2" => Ok(Self {
                enable_index_retrieval: true,
                use_symbol_lookup: true,
                use_find_references: true,
                use_read_span: true,
                ..base
            }),
            "G3" => Ok(Self {
                enable_patch_compile_gate: true,
                use_git_apply_check: true,
                use_canonical_diff: true,
                use_compile_gate: true,
                ..base
            }),
            "G5" | "TRACE" => Ok(Self {
                enable_tdd_gate: true,
                enable_index_retrieval: true,
                enable_patch_compile_gate: true,
                verify_red_test: true,
                verify_green_test: true,
                use_symbol_lookup: true,
                use_find_references: true,
                use_read_span: true,
                use_git_apply_check: true,
                use_canonical_diff: true,
                use_compile_gate: true,
                ..base
            }),
            other => bail!("unknown variant: {other}. Supported: G0, G1, G2, G3, G5/TRACE"),
        }
    }

    /// Parse a variant `config.json` body. Unknown keys are dropped by serde;
    /// missing keys fall back to defaults.
    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}
