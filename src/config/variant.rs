//! Variant bundle loading.
//!
//! Each variant lives on disk as `variants/<NAME>/config.json` plus three
//! prompt files under `variants/<NAME>/prompts/`. Missing files fail fast
//! with the offending path in the error.

use crate::config::AblationConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The three prompts a variant ships.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub localize: String,
    pub patch: String,
}

/// A fully loaded variant: parsed config plus its prompts.
#[derive(Debug, Clone)]
pub struct VariantBundle {
    pub name: String,
    pub config: AblationConfig,
    pub prompts: PromptSet,
}

impl VariantBundle {
    /// Load `variants/<name>/` from `root`. The name is uppercased so
    /// `--variant g3` and `--variant G3` resolve to the same directory.
    pub fn load(root: &Path, name: &str) -> Result<Self> {
        let name = name.to_ascii_uppercase();
        let dir = root.join("variants").join(&name);
        let cfg_path = dir.join("config.json");
        let prompts_dir = dir.join("prompts");

        let cfg_body = read_required(&cfg_path)?;
        let config = AblationConfig::from_json(&cfg_body)
            .with_context(|| format!("invalid variant config: {}", cfg_path.display()))?;

        let prompts = PromptSet {
            system: read_required(&prompts_dir.join("system.txt"))?,
            localize: read_required(&prompts_dir.join("localize.txt"))?,
            patch: read_required(&prompts_dir.join("patch.txt"))?,
        };

        Ok(Self {
            name,
            config,
            prompts,
        })
    }
}

fn read_required(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("variant file not found: {}", path.display()))
}
