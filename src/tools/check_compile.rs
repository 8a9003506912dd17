use crate::adapters::{BenchmarkAdapter, CompileReport};
use crate::tools::Tool;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Adapter-backed compile check, bound to a workdir that the loop may
/// re-point after the harness reports (or recovers) the real checkout path.
pub struct CheckCompileTool {
    adapter: Arc<dyn BenchmarkAdapter>,
    workdir: RwLock<PathBuf>,
}

impl CheckCompileTool {
    pub fn new(adapter: Arc<dyn BenchmarkAdapter>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            adapter,
            workdir: RwLock::new(workdir.into()),
        }
    }

    /// Re-point the tool at a different checkout.
    pub fn rebind(&self, workdir: impl Into<PathBuf>) {
        *self.workdir.write() = workdir.into();
    }

    /// Programmatic invocation used by the loop's compile gates.
    pub async fn run(&self) -> CompileReport {
        let workdir = self.workdir.read().clone();
        self.adapter.check_compile(&workdir).await
    }
}

#[async_trait]
impl Tool for CheckCompileTool {
    fn name(&self) -> &str {
        "check_compile"
    }

    fn description(&self) -> &str {
        "Fast compile check of the current working tree"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self.run().await)?)
    }
}
