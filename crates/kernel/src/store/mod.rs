//! Persistence for migrations, model states and operations.
//!
//! [`MemoryStore`] serves tests and embedded use; [`PgModuleStore`] keeps the
//! audit trail in PostgreSQL.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgModuleStore;

use async_trait::async_trait;

use crate::error::ModuleResult;
use crate::operation::types::{BatchSummary, NewOperation, Operation, OperationStatus};
use crate::schema::migration::{Migration, NewMigration};
use crate::schema::state::ModelState;

/// Which operations to list. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub batch_id: Option<String>,
    pub module_name: Option<String>,
    pub status: Option<OperationStatus>,
}

impl OperationFilter {
    pub fn batch(batch_id: &str) -> Self {
        Self {
            batch_id: Some(batch_id.to_string()),
            ..Self::default()
        }
    }

    pub fn module(module: &str) -> Self {
        Self {
            module_name: Some(module.to_string()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, op: &Operation) -> bool {
        self.batch_id.as_ref().is_none_or(|b| *b == op.batch_id)
            && self.module_name.as_ref().is_none_or(|m| *m == op.module_name)
            && self.status.is_none_or(|s| s == op.status)
    }
}

/// Storage backend for the module system.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Insert a pending migration. Fails with `MigrationNameConflict` if the
    /// module already has one with this name.
    async fn insert_migration(&self, new: NewMigration) -> ModuleResult<Migration>;

    async fn get_migration(&self, module: &str, name: &str) -> ModuleResult<Option<Migration>>;

    /// Persist status, timestamps and error text.
    async fn update_migration(&self, migration: &Migration) -> ModuleResult<()>;

    /// Newest first, optionally for one module.
    async fn list_migrations(
        &self,
        module: Option<&str>,
        limit: usize,
    ) -> ModuleResult<Vec<Migration>>;

    async fn count_migrations(&self, module: &str) -> ModuleResult<usize>;

    /// Sorted by model name.
    async fn model_states(&self, module: &str) -> ModuleResult<Vec<ModelState>>;

    async fn model_state(&self, module: &str, model: &str) -> ModuleResult<Option<ModelState>>;

    /// Make `states` the complete set of states for `module`.
    async fn replace_model_states(&self, module: &str, states: &[ModelState])
    -> ModuleResult<()>;

    async fn delete_model_states(&self, module: &str) -> ModuleResult<u64>;

    async fn insert_operation(&self, new: NewOperation) -> ModuleResult<Operation>;

    async fn get_operation(&self, id: i64) -> ModuleResult<Option<Operation>>;

    async fn update_operation(&self, operation: &Operation) -> ModuleResult<()>;

    /// Ordered by sequence, then id.
    async fn list_operations(&self, filter: &OperationFilter) -> ModuleResult<Vec<Operation>>;

    /// Newest batches first by earliest operation timestamp.
    async fn batch_summaries(&self, limit: usize) -> ModuleResult<Vec<BatchSummary>>;
}
