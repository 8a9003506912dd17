//! Agent-callable tools.
//!
//! Each tool implements the [`Tool`] trait in its own submodule and returns a
//! JSON report. [`setup_tools`] assembles the registry for one run: localize
//! tools always, retrieval tools behind the index gate, patch tools always
//! (the loop drives them programmatically too), compile/verify tools behind
//! their gates. The schema list handed to the model only ever describes the
//! localize surface; patch application is driven by the loop, not by model
//! tool calls.

pub mod apply_edits;
pub mod apply_patch;
pub mod check_compile;
pub mod git_diff;
pub mod index_lookup;
pub mod read_file;
pub mod read_span;
pub mod runtime;
pub mod search_in_files;
pub mod traits;

pub use apply_edits::{apply_file_edits, parse_file_edits, ApplyEditsTool, EditOp, FileEdit};
pub use apply_patch::{apply_unified_diff, ApplyPatchTool};
pub use check_compile::CheckCompileTool;
pub use git_diff::{get_git_diff, reset_to_head, GetGitDiffTool};
pub use index_lookup::{FindReferencesTool, SymbolLookupTool};
pub use read_file::ReadFileTool;
pub use read_span::ReadSpanTool;
pub use runtime::ToolRuntime;
pub use search_in_files::SearchInFilesTool;
pub use traits::{Tool, ToolSpec};
pub use verify_test::{read_trigger_test, VerifyMode, VerifyTestTool};

use crate::adapters::BenchmarkAdapter;
use crate::config::AblationConfig;
use std::path::Path;
use std::sync::Arc;

/// Assembled tool surface for one run. The compile and verify handles stay
/// accessible so the loop can invoke them directly and rebind their workdir
/// after harness/recovery.
pub struct ToolSetup {
    pub runtime: ToolRuntime,
    pub localize_specs: Vec<ToolSpec>,
    pub check_compile: Option<Arc<CheckCompileTool>>,
    pub verify_red: Option<Arc<VerifyTestTool>>,
    pub verify_green: Option<Arc<VerifyTestTool>>,
}

pub struct ToolSetupParams<'a> {
    pub workdir: &'a Path,
    pub meta_dir: &'a Path,
    pub red_log: &'a Path,
    pub green_log: &'a Path,
    pub red_test_name: Option<String>,
    pub adapter: Arc<dyn BenchmarkAdapter>,
    pub config: &'a AblationConfig,
}

/// Build the registry and the localize-phase schema list for one run.
pub fn setup_tools(params: ToolSetupParams<'_>) -> ToolSetup {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadFileTool::new(params.workdir)),
        Arc::new(SearchInFilesTool::new()),
        Arc::new(ApplyPatchTool::new(params.workdir)),
        Arc::new(ApplyEditsTool::new(params.workdir)),
        Arc::new(GetGitDiffTool::new(params.workdir)),
    ];

    if params.config.enable_index_retrieval {
        if params.config.use_symbol_lookup {
            tools.push(Arc::new(SymbolLookupTool));
        }
        if params.config.use_find_references {
            tools.push(Arc::new(FindReferencesTool));
        }
        if params.config.use_read_span {
            tools.push(Arc::new(ReadSpanTool::new(params.workdir)));
        }
    }

    let check_compile = if params.config.enable_patch_compile_gate || params.config.enable_tdd_gate
    {
        let tool = Arc::new(CheckCompileTool::new(params.adapter.clone(), params.workdir));
        tools.push(tool.clone());
        Some(tool)
    } else {
        None
    };

    let (verify_red, verify_green) = if params.config.enable_tdd_gate {
        let red = Arc::new(VerifyTestTool::new(
            params.adapter.clone(),
            VerifyMode::Red,
            params.workdir,
            params.red_test_name.clone(),
            params.meta_dir,
            params.red_log,
        ));
        let green = Arc::new(VerifyTestTool::new(
            params.adapter,
            VerifyMode::Green,
            params.workdir,
            params.red_test_name,
            params.meta_dir,
            params.green_log,
        ));
        tools.push(red.clone());
        tools.push(green.clone());
        (Some(red), Some(green))
    } else {
        (None, None)
    };

    let localize_specs = localize_tool_specs(&tools, params.config);
    ToolSetup {
        runtime: ToolRuntime::new(tools),
        localize_specs,
        check_compile,
        verify_red,
        verify_green,
    }
}

/// Schemas exposed to the model during localization: file reading and search,
/// plus the retrieval tools when the index gate is active.
fn localize_tool_specs(tools: &[Arc<dyn Tool>], config: &AblationConfig) -> Vec<ToolSpec> {
    let mut wanted = vec!["read_file", "search_in_files"];
    if config.enable_index_retrieval {
        if config.use_symbol_lookup {
            wanted.push("symbol_lookup");
        }
        if config.use_find_references {
            wanted.push("find_references");
        }
        if config.use_read_span {
            wanted.push("read_span");
        }
    }
    wanted
        .into_iter()
        .filter_map(|name| tools.iter().find(|t| t.name() == name).map(|t| t.spec()))
        .collect()
}
