//! In-process store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{ModuleStore, OperationFilter};
use crate::error::{ModuleError, ModuleResult};
use crate::operation::types::{BatchSummary, NewOperation, Operation};
use crate::schema::migration::{Migration, NewMigration};
use crate::schema::state::ModelState;

#[derive(Default)]
struct Inner {
    migrations: BTreeMap<i64, Migration>,
    next_migration_id: i64,
    /// Keyed by (module, model).
    states: BTreeMap<(String, String), ModelState>,
    operations: BTreeMap<i64, Operation>,
    next_operation_id: i64,
}

/// Store that keeps everything in memory for the life of the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleStore for MemoryStore {
    async fn insert_migration(&self, new: NewMigration) -> ModuleResult<Migration> {
        let mut inner = self.inner.lock();
        let exists = inner.migrations.values().any(|m| {
            m.module_name == new.module_name && m.migration_name == new.migration_name
        });
        if exists {
            return Err(ModuleError::MigrationNameConflict {
                module: new.module_name,
                migration: new.migration_name,
            });
        }

        inner.next_migration_id += 1;
        let migration = Migration::from_new(new, inner.next_migration_id, Utc::now());
        inner.migrations.insert(migration.id, migration.clone());
        Ok(migration)
    }

    async fn get_migration(&self, module: &str, name: &str) -> ModuleResult<Option<Migration>> {
        Ok(self
            .inner
            .lock()
            .migrations
            .values()
            .find(|m| m.module_name == module && m.migration_name == name)
            .cloned())
    }

    async fn update_migration(&self, migration: &Migration) -> ModuleResult<()> {
        let mut inner = self.inner.lock();
        match inner.migrations.get_mut(&migration.id) {
            Some(existing) => {
                *existing = migration.clone();
                Ok(())
            }
            None => Err(ModuleError::MigrationNotFound {
                module: migration.module_name.clone(),
                migration: migration.migration_name.clone(),
            }),
        }
    }

    async fn list_migrations(
        &self,
        module: Option<&str>,
        limit: usize,
    ) -> ModuleResult<Vec<Migration>> {
        Ok(self
            .inner
            .lock()
            .migrations
            .values()
            .rev()
            .filter(|m| module.is_none_or(|name| m.module_name == name))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_migrations(&self, module: &str) -> ModuleResult<usize> {
        Ok(self
            .inner
            .lock()
            .migrations
            .values()
            .filter(|m| m.module_name == module)
            .count())
    }

    async fn model_states(&self, module: &str) -> ModuleResult<Vec<ModelState>> {
        Ok(self
            .inner
            .lock()
            .states
            .values()
            .filter(|s| s.module_name == module)
            .cloned()
            .collect())
    }

    async fn model_state(&self, module: &str, model: &str) -> ModuleResult<Option<ModelState>> {
        Ok(self
            .inner
            .lock()
            .states
            .get(&(module.to_string(), model.to_string()))
            .cloned())
    }

    async fn replace_model_states(
        &self,
        module: &str,
        states: &[ModelState],
    ) -> ModuleResult<()> {
        let mut inner = self.inner.lock();
        inner.states.retain(|(m, _), _| m != module);
        for state in states {
            inner.states.insert(
                (module.to_string(), state.model_name.clone()),
                state.clone(),
            );
        }
        Ok(())
    }

    async fn delete_model_states(&self, module: &str) -> ModuleResult<u64> {
        let mut inner = self.inner.lock();
        let before = inner.states.len();
        inner.states.retain(|(m, _), _| m != module);
        Ok((before - inner.states.len()) as u64)
    }

    async fn insert_operation(&self, new: NewOperation) -> ModuleResult<Operation> {
        let mut inner = self.inner.lock();
        inner.next_operation_id += 1;
        let operation = Operation::from_new(new, inner.next_operation_id, Utc::now());
        inner.operations.insert(operation.id, operation.clone());
        Ok(operation)
    }

    async fn get_operation(&self, id: i64) -> ModuleResult<Option<Operation>> {
        Ok(self.inner.lock().operations.get(&id).cloned())
    }

    async fn update_operation(&self, operation: &Operation) -> ModuleResult<()> {
        let mut inner = self.inner.lock();
        match inner.operations.get_mut(&operation.id) {
            Some(existing) => {
                *existing = operation.clone();
                Ok(())
            }
            None => Err(ModuleError::OperationNotFound { id: operation.id }),
        }
    }

    async fn list_operations(&self, filter: &OperationFilter) -> ModuleResult<Vec<Operation>> {
        let mut ops: Vec<Operation> = self
            .inner
            .lock()
            .operations
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        ops.sort_by_key(|op| (op.sequence, op.id));
        Ok(ops)
    }

    async fn batch_summaries(&self, limit: usize) -> ModuleResult<Vec<BatchSummary>> {
        let mut batches: BTreeMap<String, Vec<Operation>> = BTreeMap::new();
        for op in self.inner.lock().operations.values() {
            batches
                .entry(op.batch_id.clone())
                .or_default()
                .push(op.clone());
        }

        let mut summaries: Vec<BatchSummary> = batches
            .values()
            .filter_map(|ops| BatchSummary::from_operations(ops))
            .collect();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.batch_id.cmp(&a.batch_id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }
}
