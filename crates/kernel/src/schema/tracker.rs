//! Schema state tracking for one store and executor.
//!
//! The tracker compares what modules declare against what was last applied,
//! turns the difference into a named migration, hands it to the executor and
//! records the outcome.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::executor::SchemaExecutor;
use super::migration::{Migration, MigrationStatus, MigrationType, NewMigration, migration_name};
use super::operations::{
    ChangePlan, SchemaOperation, operations_checksum, plan_changes, plan_drop,
};
use super::snapshot::ModelDefinition;
use super::state::{DriftReport, ModelState, detect_drift};
use crate::error::{ModuleError, ModuleResult};
use crate::store::ModuleStore;

pub struct SchemaTracker {
    store: Arc<dyn ModuleStore>,
    executor: Arc<dyn SchemaExecutor>,
}

fn ensure_transition(migration: &Migration, next: MigrationStatus) -> ModuleResult<()> {
    if migration.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(ModuleError::transition(
            "migration",
            format!("{}/{}", migration.module_name, migration.migration_name),
            migration.status,
            next,
        ))
    }
}

impl SchemaTracker {
    pub fn new(store: Arc<dyn ModuleStore>, executor: Arc<dyn SchemaExecutor>) -> Self {
        Self { store, executor }
    }

    pub fn store(&self) -> &Arc<dyn ModuleStore> {
        &self.store
    }

    /// One report per declared model.
    pub async fn check_drift(
        &self,
        module: &str,
        models: &[ModelDefinition],
    ) -> ModuleResult<Vec<DriftReport>> {
        let stored = self.store.model_states(module).await?;
        Ok(models
            .iter()
            .map(|model| {
                let state = stored.iter().find(|s| s.model_name == model.name);
                detect_drift(module, model, state)
            })
            .collect())
    }

    /// Operations that bring the stored state of `module` to `models`.
    ///
    /// Stored models the module no longer declares are dropped first. A model
    /// whose table name changed is dropped and recreated.
    pub async fn plan_module(
        &self,
        module: &str,
        models: &[ModelDefinition],
    ) -> ModuleResult<ChangePlan> {
        let stored = self.store.model_states(module).await?;
        let mut plan = ChangePlan::default();

        for state in &stored {
            if !models.iter().any(|m| m.name == state.model_name) {
                plan.extend(plan_drop(&state.table_name, &state.snapshot));
            }
        }

        for model in models {
            match stored.iter().find(|s| s.model_name == model.name) {
                Some(state) if state.table_name != model.table_name => {
                    plan.extend(plan_drop(&state.table_name, &state.snapshot));
                    plan.extend(plan_changes(&model.table_name, None, Some(&model.snapshot)));
                }
                Some(state) if state.checksum == model.checksum() => {}
                state => plan.extend(plan_changes(
                    &model.table_name,
                    state.map(|s| &s.snapshot),
                    Some(&model.snapshot),
                )),
            }
        }

        Ok(plan)
    }

    /// Store a new pending migration.
    ///
    /// Fails with `MigrationChecksumConflict` when the operations are the
    /// same as those of the module's latest migration that is pending or
    /// applied; running them twice is a configuration error.
    pub async fn create_migration(&self, new: NewMigration) -> ModuleResult<Migration> {
        if !new.operations.is_empty() {
            let latest = self
                .store
                .list_migrations(Some(&new.module_name), 1)
                .await?
                .into_iter()
                .next();
            let checksum = operations_checksum(&new.operations);
            if let Some(head) = latest.filter(|m| {
                matches!(m.status, MigrationStatus::Pending | MigrationStatus::Applied)
                    && m.checksum == checksum
            }) {
                return Err(ModuleError::MigrationChecksumConflict {
                    module: new.module_name,
                    migration: new.migration_name,
                    existing: head.migration_name,
                    checksum,
                });
            }
        }

        let migration = self.store.insert_migration(new).await?;
        debug!(
            module = %migration.module_name,
            migration = %migration.migration_name,
            checksum = %migration.checksum,
            "created migration"
        );
        Ok(migration)
    }

    /// Next `NNNN_suffix` name for `module`.
    pub async fn next_migration_name(&self, module: &str, suffix: &str) -> ModuleResult<String> {
        let count = self.store.count_migrations(module).await?;
        Ok(migration_name(count + 1, suffix))
    }

    pub async fn get_migration(&self, module: &str, name: &str) -> ModuleResult<Migration> {
        self.store
            .get_migration(module, name)
            .await?
            .ok_or_else(|| ModuleError::MigrationNotFound {
                module: module.to_string(),
                migration: name.to_string(),
            })
    }

    pub async fn mark_applied(&self, module: &str, name: &str) -> ModuleResult<Migration> {
        let mut migration = self.get_migration(module, name).await?;
        migration.mark_applied(Utc::now())?;
        self.store.update_migration(&migration).await?;
        Ok(migration)
    }

    pub async fn mark_failed(&self, module: &str, name: &str, error: &str) -> ModuleResult<Migration> {
        let mut migration = self.get_migration(module, name).await?;
        migration.mark_failed(error)?;
        self.store.update_migration(&migration).await?;
        Ok(migration)
    }

    pub async fn mark_rolled_back(&self, module: &str, name: &str) -> ModuleResult<Migration> {
        let mut migration = self.get_migration(module, name).await?;
        migration.mark_rolled_back(Utc::now())?;
        self.store.update_migration(&migration).await?;
        Ok(migration)
    }

    /// Execute a pending migration and record the outcome.
    ///
    /// An executor error marks the migration failed and is returned as
    /// `MigrationFailed`.
    pub async fn apply_migration(&self, module: &str, name: &str) -> ModuleResult<Migration> {
        let mut migration = self.get_migration(module, name).await?;
        ensure_transition(&migration, MigrationStatus::Applied)?;

        match self.executor.execute(module, &migration.operations).await {
            Ok(()) => {
                migration.mark_applied(Utc::now())?;
                self.store.update_migration(&migration).await?;
                info!(
                    module = %module,
                    migration = %name,
                    operations = migration.operations.len(),
                    "migration applied"
                );
                Ok(migration)
            }
            Err(e) => {
                let details = format!("{e:#}");
                migration.mark_failed(&details)?;
                self.store.update_migration(&migration).await?;
                warn!(module = %module, migration = %name, error = %details, "migration failed");
                Err(ModuleError::MigrationFailed {
                    module: module.to_string(),
                    migration: name.to_string(),
                    details,
                })
            }
        }
    }

    /// Undo an applied migration with its rollback operations.
    ///
    /// Migrations recorded without rollback operations are undone with the
    /// inverses of their forward operations.
    pub async fn rollback_migration(&self, module: &str, name: &str) -> ModuleResult<Migration> {
        let mut migration = self.get_migration(module, name).await?;
        ensure_transition(&migration, MigrationStatus::RolledBack)?;

        let operations: Vec<SchemaOperation> = match &migration.rollback_operations {
            Some(ops) => ops.clone(),
            None => migration
                .operations
                .iter()
                .rev()
                .map(SchemaOperation::inverse)
                .collect(),
        };

        self.executor
            .execute(module, &operations)
            .await
            .map_err(|e| ModuleError::MigrationFailed {
                module: module.to_string(),
                migration: name.to_string(),
                details: format!("rollback: {e:#}"),
            })?;

        migration.mark_rolled_back(Utc::now())?;
        self.store.update_migration(&migration).await?;
        info!(module = %module, migration = %name, "migration rolled back");
        Ok(migration)
    }

    /// Make `models` the recorded state of `module`.
    pub async fn record_applied(
        &self,
        module: &str,
        version: &str,
        migration: Option<&str>,
        models: &[ModelDefinition],
    ) -> ModuleResult<()> {
        let now = Utc::now();
        let states: Vec<ModelState> = models
            .iter()
            .map(|model| ModelState::from_definition(module, model, version, migration, now))
            .collect();
        self.store.replace_model_states(module, &states).await
    }

    /// Put back a previously captured set of states.
    pub async fn restore_states(&self, module: &str, states: &[ModelState]) -> ModuleResult<()> {
        self.store.replace_model_states(module, states).await
    }

    pub async fn remove_states(&self, module: &str) -> ModuleResult<u64> {
        let removed = self.store.delete_model_states(module).await?;
        debug!(module = %module, removed, "removed model states");
        Ok(removed)
    }

    pub async fn model_states(&self, module: &str) -> ModuleResult<Vec<ModelState>> {
        self.store.model_states(module).await
    }

    /// Newest first.
    pub async fn history(&self, module: Option<&str>, limit: usize) -> ModuleResult<Vec<Migration>> {
        self.store.list_migrations(module, limit).await
    }

    /// Most recent migration of `module` that is still applied.
    pub async fn last_applied(&self, module: &str) -> ModuleResult<Option<Migration>> {
        Ok(self
            .store
            .list_migrations(Some(module), usize::MAX)
            .await?
            .into_iter()
            .find(|m| m.status == MigrationStatus::Applied))
    }

    /// Bring `module` in line with `models`: plan, store, execute, record.
    ///
    /// Returns `None` when there was nothing to execute. A checksum change
    /// with no operations behind it (a column reorder) is still recorded.
    pub async fn migrate_module(
        &self,
        module: &str,
        version: &str,
        models: &[ModelDefinition],
        migration_type: MigrationType,
    ) -> ModuleResult<Option<Migration>> {
        let plan = self.plan_module(module, models).await?;
        if plan.is_empty() {
            let drifted = self
                .check_drift(module, models)
                .await?
                .iter()
                .any(DriftReport::has_drift);
            if drifted {
                let last = self.last_applied(module).await?.map(|m| m.migration_name);
                self.record_applied(module, version, last.as_deref(), models)
                    .await?;
                info!(module = %module, "recorded schema state with no operations");
            } else {
                debug!(module = %module, "no schema drift");
            }
            return Ok(None);
        }

        let name = self
            .next_migration_name(module, migration_type.as_str())
            .await?;
        self.create_migration(NewMigration {
            module_name: module.to_string(),
            version: version.to_string(),
            migration_name: name.clone(),
            migration_type,
            operations: plan.operations,
            rollback_operations: Some(plan.rollback_operations),
            description: Some(format!("{} {version}", migration_type.as_str())),
        })
        .await?;

        let migration = self.apply_migration(module, &name).await?;
        self.record_applied(module, version, Some(&name), models).await?;
        Ok(Some(migration))
    }

    /// Drop every table recorded for `module` and forget its states.
    ///
    /// Returns `None` when nothing was recorded.
    pub async fn drop_module(&self, module: &str, version: &str) -> ModuleResult<Option<Migration>> {
        let plan = self.plan_module(module, &[]).await?;
        if plan.is_empty() {
            self.remove_states(module).await?;
            return Ok(None);
        }

        let name = self.next_migration_name(module, "remove").await?;
        self.create_migration(NewMigration {
            module_name: module.to_string(),
            version: version.to_string(),
            migration_name: name.clone(),
            migration_type: MigrationType::Schema,
            operations: plan.operations,
            rollback_operations: Some(plan.rollback_operations),
            description: Some(format!("remove {version}")),
        })
        .await?;

        let migration = self.apply_migration(module, &name).await?;
        self.remove_states(module).await?;
        Ok(Some(migration))
    }
}
