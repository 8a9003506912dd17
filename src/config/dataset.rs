//! Dataset configuration.
//!
//! Read-only JSON describing where a benchmark's scratch data lives. Path
//! templates use `{scratch_base}`, `{pid}`, `{bid}` and `{APR_DIR}`
//! placeholders and are expanded per bug instance.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub version: Option<String>,
    pub paths: DatasetPathTemplates,
    /// Environment variables the adapter exports before shelling out
    /// (JAVA_HOME, container image names, and the like).
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetPathTemplates {
    pub scratch_base: String,
    pub workdir_template: String,
    #[serde(default)]
    pub index_dir_template: Option<String>,
    pub log_dir_template: String,
    pub meta_dir_template: String,
}

/// Concrete per-instance paths after template expansion.
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub workdir: PathBuf,
    pub index_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub meta_dir: PathBuf,
}

impl DatasetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("dataset config not found: {}", path.display()))?;
        serde_json::from_str(&body)
            .with_context(|| format!("invalid dataset config: {}", path.display()))
    }

    /// Expand the path templates for one bug instance.
    ///
    /// `apr_dir` substitutes `{APR_DIR}`; `{bid}` expands without any suffix,
    /// so templates spell the `b` themselves (e.g. `{pid}-{bid}b`).
    pub fn resolve(&self, apr_dir: &Path, pid: &str, bid: u32) -> DatasetPaths {
        let expand = |template: &str| -> PathBuf {
            PathBuf::from(
                template
                    .replace("{scratch_base}", &self.paths.scratch_base)
                    .replace("{APR_DIR}", &apr_dir.to_string_lossy())
                    .replace("{pid}", pid)
                    .replace("{bid}", &bid.to_string()),
            )
        };
        DatasetPaths {
            workdir: expand(&self.paths.workdir_template),
            index_dir: self.paths.index_dir_template.as_deref().map(&expand),
            log_dir: expand(&self.paths.log_dir_template),
            meta_dir: expand(&self.paths.meta_dir_template),
        }
    }
}
