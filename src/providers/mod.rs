//! LLM provider subsystem.
//!
//! A [`Provider`] turns a conversation plus tool schemas into one chat
//! completion. The only concrete implementation speaks the OpenAI-compatible
//! wire protocol, which covers OpenAI itself, DeepSeek, and local vLLM
//! endpoints. Model descriptions live in `models/<name>.json` and carry the
//! credential env var, base URL, and optional served-model indirection.

pub mod openai;
pub mod retry;
pub mod traits;

pub use openai::OpenAiCompatProvider;
pub use retry::{classify_api_error, with_retry, ErrorClass, RetryError};
pub use traits::{ChatResponse, Provider, TokenUsage, ToolCall, ToolChoice};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// On-disk model description (`models/<name>.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider_kind")]
    pub provider: String,
    pub api_key_env: String,
    /// Fallback credential for endpoints that accept any key (local vLLM).
    #[serde(default)]
    pub api_key_default: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub base_url_env: Option<String>,
    /// Served model id when it differs from the config file name
    /// (e.g. `Qwen/Qwen3-Coder-30B-A3B-Instruct` behind `qwen3-coder-vllm`).
    #[serde(default)]
    pub model_id: Option<String>,
}

fn default_provider_kind() -> String {
    "openai".into()
}

impl ModelConfig {
    pub fn load(models_dir: &Path, model_name: &str) -> Result<Self> {
        let path = models_dir.join(format!("{model_name}.json"));
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("model config not found: {}", path.display()))?;
        serde_json::from_str(&body)
            .with_context(|| format!("invalid model config: {}", path.display()))
    }

    /// The model id to send over the wire: `model_id` when present, the
    /// config name otherwise.
    pub fn api_model_name<'a>(&'a self, model_name: &'a str) -> &'a str {
        self.model_id.as_deref().unwrap_or(model_name)
    }

    fn resolve_credential(&self) -> Result<String> {
        if let Ok(key) = std::env::var(&self.api_key_env) {
            if !key.trim().is_empty() {
                return Ok(key);
            }
        }
        if let Some(fallback) = &self.api_key_default {
            return Ok(fallback.clone());
        }
        bail!(
            "environment variable {} not set; for local endpoints add \"api_key_default\" to the model config",
            self.api_key_env
        )
    }

    fn resolve_base_url(&self) -> Option<String> {
        if let Some(env) = &self.base_url_env {
            if let Ok(url) = std::env::var(env) {
                if !url.trim().is_empty() {
                    return Some(url);
                }
            }
        }
        self.base_url.clone()
    }
}

/// Build a provider for `model_name` from `models_dir`.
pub fn create_provider(models_dir: &Path, model_name: &str) -> Result<(Arc<dyn Provider>, String)> {
    let cfg = ModelConfig::load(models_dir, model_name)?;
    let api_model = cfg.api_model_name(model_name).to_string();
    match cfg.provider.as_str() {
        "openai" | "openai_compat" => {
            let credential = cfg.resolve_credential()?;
            let provider =
                OpenAiCompatProvider::new(cfg.resolve_base_url().as_deref(), &credential);
            Ok((Arc::new(provider), api_model))
        }
        other => bail!("unsupported provider kind: {other}"),
    }
}
