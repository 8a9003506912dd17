use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Declarative tool description handed to providers as a function schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// An agent-callable capability.
///
/// `execute` returns a JSON report (`{"ok": true, ...}` on success) rather
/// than an error: the model is expected to read failures and react, so they
/// are data. An `Err` from `execute` means the tool itself broke and is
/// converted by the runtime into an `ok:false` report.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Read-only tools opt in to result memoization.
    fn cacheable(&self) -> bool {
        false
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
