//! Seams to the host: who applies schema operations and who declares models.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::operations::SchemaOperation;
use super::snapshot::ModelDefinition;

/// Applies schema operations to the real database.
///
/// The kernel only records intent and state; implementations own the DDL.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    async fn execute(&self, module: &str, operations: &[SchemaOperation]) -> anyhow::Result<()>;
}

/// Supplies the models a module declares.
pub trait ModelProvider: Send + Sync {
    fn models(&self, module: &str) -> Vec<ModelDefinition>;
}

/// Executor that records what it was asked to do and always succeeds.
#[derive(Default)]
pub struct DryRunExecutor {
    executed: Mutex<Vec<(String, Vec<SchemaOperation>)>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, oldest first.
    pub fn executed(&self) -> Vec<(String, Vec<SchemaOperation>)> {
        self.executed.lock().clone()
    }

    /// Operations executed for one module, flattened.
    pub fn operations_for(&self, module: &str) -> Vec<SchemaOperation> {
        self.executed
            .lock()
            .iter()
            .filter(|(m, _)| m == module)
            .flat_map(|(_, ops)| ops.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl SchemaExecutor for DryRunExecutor {
    async fn execute(&self, module: &str, operations: &[SchemaOperation]) -> anyhow::Result<()> {
        debug!(module = %module, count = operations.len(), "dry-run schema operations");
        self.executed
            .lock()
            .push((module.to_string(), operations.to_vec()));
        Ok(())
    }
}

/// Model declarations held in memory, set by the host at startup.
#[derive(Default)]
pub struct StaticModelProvider {
    models: RwLock<HashMap<String, Vec<ModelDefinition>>>,
}

impl StaticModelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the models declared by `module`.
    pub fn set(&self, module: &str, models: Vec<ModelDefinition>) {
        self.models.write().insert(module.to_string(), models);
    }

    pub fn with(self, module: &str, models: Vec<ModelDefinition>) -> Self {
        self.set(module, models);
        self
    }
}

impl ModelProvider for StaticModelProvider {
    fn models(&self, module: &str) -> Vec<ModelDefinition> {
        self.models.read().get(module).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::snapshot::SchemaSnapshot;

    #[tokio::test]
    async fn dry_run_records_calls() {
        let executor = DryRunExecutor::new();
        let op = SchemaOperation::CreateTable {
            table: "t".into(),
            snapshot: SchemaSnapshot::new(),
        };
        executor.execute("crm", std::slice::from_ref(&op)).await.unwrap();
        executor.execute("sales", &[]).await.unwrap();

        assert_eq!(executor.executed().len(), 2);
        assert_eq!(executor.operations_for("crm"), vec![op]);
        assert!(executor.operations_for("sales").is_empty());
    }

    #[test]
    fn static_provider_defaults_to_no_models() {
        let provider = StaticModelProvider::new().with(
            "crm",
            vec![ModelDefinition::new("lead", "crm_lead", SchemaSnapshot::new())],
        );
        assert_eq!(provider.models("crm").len(), 1);
        assert!(provider.models("sales").is_empty());
    }
}
