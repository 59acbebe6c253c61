//! Mark-and-apply batches of module operations.
//!
//! Marking queues `pending` operations under a batch id and moves the
//! registry into the matching `to_*` state. Applying runs the batch in
//! sequence order, migrating each module's schema through the tracker.
//! Rollback undoes successful operations from the data captured just before
//! they ran.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::types::{
    ApplyReport, BatchSummary, FailurePolicy, NewOperation, Operation, OperationKind,
    OperationStatus, RollbackReport, new_batch_id,
};
use crate::error::{ModuleError, ModuleResult};
use crate::module::dependency::resolve_load_order;
use crate::module::hooks::{self, HookEvent};
use crate::module::{ModuleLoader, ModuleRegistry, ModuleState};
use crate::schema::executor::{ModelProvider, SchemaExecutor};
use crate::schema::migration::MigrationType;
use crate::schema::state::ModelState;
use crate::schema::tracker::SchemaTracker;
use crate::store::{ModuleStore, OperationFilter};

/// Gap between sequence numbers so operations can be slotted in later.
const SEQUENCE_STEP: usize = 10;

/// Registry states in which a module counts as present in the database.
fn is_present(state: Option<ModuleState>) -> bool {
    matches!(
        state,
        Some(ModuleState::Installed | ModuleState::ToUpgrade | ModuleState::ToRemove)
    )
}

pub struct OperationCoordinator {
    registry: Arc<ModuleRegistry>,
    loader: Arc<ModuleLoader>,
    store: Arc<dyn ModuleStore>,
    tracker: SchemaTracker,
    models: Arc<dyn ModelProvider>,
}

impl OperationCoordinator {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        loader: Arc<ModuleLoader>,
        store: Arc<dyn ModuleStore>,
        executor: Arc<dyn SchemaExecutor>,
        models: Arc<dyn ModelProvider>,
    ) -> Self {
        let tracker = SchemaTracker::new(store.clone(), executor);
        Self {
            registry,
            loader,
            store,
            tracker,
            models,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &SchemaTracker {
        &self.tracker
    }

    /// Queue one operation, capturing the module's current version, state
    /// and model states for rollback.
    pub async fn create_operation(
        &self,
        module: &str,
        kind: OperationKind,
        batch_id: &str,
        sequence: i32,
        marked_by: Option<i64>,
    ) -> ModuleResult<Operation> {
        let previous_state = self.registry.state(module);
        let (previous_version, rollback_data) = self.capture_prior(module, previous_state).await?;

        let operation = self
            .store
            .insert_operation(NewOperation {
                batch_id: batch_id.to_string(),
                module_name: module.to_string(),
                kind,
                sequence,
                marked_by,
                previous_version,
                previous_state,
                rollback_data: Some(rollback_data),
            })
            .await?;

        debug!(
            batch_id = %batch_id,
            module = %module,
            kind = %kind,
            sequence,
            "queued module operation"
        );
        Ok(operation)
    }

    /// Queue installs for `names` and every dependency not yet installed.
    ///
    /// Returns the batch id used.
    pub async fn mark_for_install(
        &self,
        names: &[&str],
        marked_by: Option<i64>,
        batch_id: Option<&str>,
    ) -> ModuleResult<String> {
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<(String, Option<String>)> =
            names.iter().rev().map(|n| (n.to_string(), None)).collect();

        while let Some((name, required_by)) = stack.pop() {
            if wanted.contains(&name) {
                continue;
            }
            if self.registry.is_installed(&name) {
                if required_by.is_none() {
                    info!(module = %name, "already installed, skipping");
                }
                continue;
            }

            if let Err(e) = self.ensure_registered(&name) {
                return Err(match (e, required_by) {
                    (ModuleError::NotFound { .. }, Some(parent)) => {
                        ModuleError::missing_dependency(parent, &name)
                    }
                    (e, _) => e,
                });
            }
            let info = self
                .registry
                .get(&name)
                .ok_or_else(|| ModuleError::not_found(&name))?;

            if !info.manifest.installable {
                return Err(ModuleError::invalid(&name, "module is not installable"));
            }
            if info.state == ModuleState::ToRemove {
                let reason = match &required_by {
                    Some(parent) => format!("queued for removal but required by '{parent}'"),
                    None => "queued for removal".to_string(),
                };
                return Err(ModuleError::invalid(&name, reason));
            }

            for dep in info.depends() {
                stack.push((dep.clone(), Some(name.clone())));
            }
            wanted.insert(name);
        }

        self.queue(wanted, OperationKind::Install, marked_by, batch_id)
            .await
    }

    /// Queue upgrades for installed modules.
    pub async fn mark_for_upgrade(
        &self,
        names: &[&str],
        marked_by: Option<i64>,
        batch_id: Option<&str>,
    ) -> ModuleResult<String> {
        let mut wanted = BTreeSet::new();
        for name in names {
            self.require_installed(name)?;
            wanted.insert(name.to_string());
        }
        self.queue(wanted, OperationKind::Upgrade, marked_by, batch_id)
            .await
    }

    /// Queue removals for installed modules, dependents first.
    ///
    /// Every module that depends on one being removed must be part of the
    /// same request.
    pub async fn mark_for_remove(
        &self,
        names: &[&str],
        marked_by: Option<i64>,
        batch_id: Option<&str>,
    ) -> ModuleResult<String> {
        let wanted: BTreeSet<String> = names.iter().map(|n| n.to_string()).collect();
        for name in &wanted {
            self.require_installed(name)?;
            for dependent in self.registry.dependents(name) {
                let state = self.registry.state(&dependent);
                let blocking = state.is_some_and(|s| s != ModuleState::Uninstalled);
                if blocking && !wanted.contains(&dependent) {
                    return Err(ModuleError::invalid(
                        name,
                        format!("required by installed module '{dependent}'"),
                    ));
                }
            }
        }
        self.queue(wanted, OperationKind::Remove, marked_by, batch_id)
            .await
    }

    /// Pending operations, optionally for one batch, by sequence then id.
    ///
    /// Across batches, every operation of an earlier batch comes before any
    /// of a later one. Batches are ordered by their first operation.
    pub async fn pending(&self, batch_id: Option<&str>) -> ModuleResult<Vec<Operation>> {
        let filter = OperationFilter {
            batch_id: batch_id.map(str::to_string),
            ..OperationFilter::default()
        }
        .with_status(OperationStatus::Pending);
        let mut operations = self.store.list_operations(&filter).await?;
        if batch_id.is_none() {
            order_by_batch(&mut operations);
        }
        Ok(operations)
    }

    /// Every operation in a batch, by sequence then id.
    pub async fn batch(&self, batch_id: &str) -> ModuleResult<Vec<Operation>> {
        let operations = self
            .store
            .list_operations(&OperationFilter::batch(batch_id))
            .await?;
        if operations.is_empty() {
            return Err(ModuleError::BatchNotFound {
                batch_id: batch_id.to_string(),
            });
        }
        Ok(operations)
    }

    /// Every operation recorded for a module, by sequence then id.
    pub async fn operations_for(&self, module: &str) -> ModuleResult<Vec<Operation>> {
        self.store
            .list_operations(&OperationFilter::module(module))
            .await
    }

    /// Cancel pending operations and put their modules back in the state
    /// they had when marked.
    pub async fn cancel_pending(&self, batch_id: Option<&str>) -> ModuleResult<usize> {
        let pending = self.pending(batch_id).await?;
        let count = pending.len();

        for mut operation in pending {
            operation.cancel()?;
            self.store.update_operation(&operation).await?;
            self.restore_registry_state(&operation);
        }

        if count > 0 {
            info!(batch_id = ?batch_id, count, "cancelled pending operations");
        }
        Ok(count)
    }

    /// Whether the module has an operation waiting or running.
    pub async fn has_pending_for(&self, module: &str) -> ModuleResult<bool> {
        Ok(self
            .operations_for(module)
            .await?
            .iter()
            .any(|op| op.status.is_outstanding()))
    }

    pub async fn get_operation(&self, id: i64) -> ModuleResult<Operation> {
        self.store
            .get_operation(id)
            .await?
            .ok_or(ModuleError::OperationNotFound { id })
    }

    /// Mark an operation running for a caller that does the work itself.
    pub async fn start(&self, id: i64, executed_by: Option<i64>) -> ModuleResult<Operation> {
        let mut operation = self.get_operation(id).await?;
        operation.start(Utc::now())?;
        operation.executed_by = executed_by;
        self.registry
            .set_state(&operation.module_name, operation.kind.marked_state())?;
        self.store.update_operation(&operation).await?;
        Ok(operation)
    }

    /// Record success and move the module to its post-operation state.
    pub async fn complete_success(&self, id: i64) -> ModuleResult<Operation> {
        let mut operation = self.get_operation(id).await?;
        operation.complete_success(Utc::now())?;
        self.store.update_operation(&operation).await?;
        self.registry
            .set_state(&operation.module_name, operation.kind.completed_state())?;
        Ok(operation)
    }

    /// Record failure, for example after a caller-side timeout, and put the
    /// module back in the state it had when marked.
    pub async fn complete_failure(
        &self,
        id: i64,
        error: &str,
        trace: Option<&str>,
    ) -> ModuleResult<Operation> {
        let mut operation = self.get_operation(id).await?;
        operation.complete_failure(error, trace, Utc::now())?;
        self.store.update_operation(&operation).await?;
        self.restore_registry_state(&operation);
        Ok(operation)
    }

    /// Run pending operations in sequence order.
    ///
    /// Each failure is recorded on its operation. With
    /// [`FailurePolicy::Halt`] the remaining operations stay pending.
    pub async fn apply_pending(
        &self,
        batch_id: Option<&str>,
        executed_by: Option<i64>,
        policy: FailurePolicy,
    ) -> ModuleResult<ApplyReport> {
        let pending = self.pending(batch_id).await?;
        let total = pending.len();
        let mut report = ApplyReport::default();

        for (index, operation) in pending.into_iter().enumerate() {
            let id = operation.id;
            match self.execute(operation, executed_by).await {
                Ok(()) => report.succeeded.push(id),
                Err(e) => {
                    report.failed.push((id, e.to_string()));
                    if policy == FailurePolicy::Halt {
                        report.remaining = total - index - 1;
                        warn!(
                            operation = id,
                            remaining = report.remaining,
                            "halting batch after failed operation"
                        );
                        break;
                    }
                }
            }
        }

        info!(
            batch_id = ?batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            remaining = report.remaining,
            "applied pending operations"
        );
        Ok(report)
    }

    /// Undo one operation.
    ///
    /// A successful operation has its migration rolled back and its prior
    /// model states and registry state restored. A failed one changed
    /// nothing and is only marked.
    pub async fn rollback_operation(&self, id: i64) -> ModuleResult<Operation> {
        let mut operation = self.get_operation(id).await?;
        let module = operation.module_name.clone();

        match operation.status {
            OperationStatus::Success => {
                if let Some(migration) = operation.applied_migration().map(str::to_string) {
                    self.tracker.rollback_migration(&module, &migration).await?;
                }
                if let Some(states) = previous_states(&operation)? {
                    self.tracker.restore_states(&module, &states).await?;
                }
                self.restore_registry_state(&operation);
            }
            OperationStatus::Failed => {}
            other => {
                return Err(ModuleError::transition(
                    "operation",
                    id.to_string(),
                    other,
                    OperationStatus::RolledBack,
                ));
            }
        }

        operation.mark_rolled_back()?;
        self.store.update_operation(&operation).await?;
        info!(operation = id, module = %module, kind = %operation.kind, "operation rolled back");
        Ok(operation)
    }

    /// Roll back every successful operation of a batch, last first.
    ///
    /// Keeps going past individual failures and reports them.
    pub async fn rollback_batch(&self, batch_id: &str) -> ModuleResult<RollbackReport> {
        let operations = self.batch(batch_id).await?;
        let mut report = RollbackReport::default();

        for operation in operations
            .iter()
            .rev()
            .filter(|op| op.status == OperationStatus::Success)
        {
            match self.rollback_operation(operation.id).await {
                Ok(_) => report.rolled_back.push(operation.id),
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        operation = operation.id,
                        error = %e,
                        "rollback failed"
                    );
                    report.errors.push((operation.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Per-batch status counts, newest batch first.
    pub async fn recent_batches(&self, limit: usize) -> ModuleResult<Vec<BatchSummary>> {
        self.store.batch_summaries(limit).await
    }

    fn ensure_registered(&self, name: &str) -> ModuleResult<()> {
        if self.registry.contains(name) {
            return Ok(());
        }
        let path = self.loader.require_path(name)?;
        let manifest = self.loader.load_manifest(&path)?;
        self.registry.register(name, (*manifest).clone(), path);
        Ok(())
    }

    fn require_installed(&self, name: &str) -> ModuleResult<()> {
        match self.registry.state(name) {
            None => Err(ModuleError::not_found(name)),
            Some(ModuleState::Installed) => Ok(()),
            Some(state) => Err(ModuleError::invalid(
                name,
                format!("module is {state}, not installed"),
            )),
        }
    }

    /// Version and rollback data describing `module` right now.
    async fn capture_prior(
        &self,
        module: &str,
        previous_state: Option<ModuleState>,
    ) -> ModuleResult<(Option<String>, serde_json::Value)> {
        let version = match self.tracker.last_applied(module).await? {
            Some(migration) => Some(migration.version),
            None if is_present(previous_state) => self
                .registry
                .get(module)
                .map(|info| info.version().to_string()),
            None => None,
        };
        let states = self.tracker.model_states(module).await?;

        let data = json!({
            "previous_state": previous_state,
            "previous_version": version,
            "previous_states": states,
        });
        Ok((version, data))
    }

    /// Queue `modules` in dependency order under one batch.
    async fn queue(
        &self,
        modules: BTreeSet<String>,
        kind: OperationKind,
        marked_by: Option<i64>,
        batch_id: Option<&str>,
    ) -> ModuleResult<String> {
        let batch_id = batch_id.map_or_else(new_batch_id, str::to_string);

        let mut selected = BTreeSet::new();
        for name in modules {
            if self.has_pending_for(&name).await? {
                info!(module = %name, "operation already pending, skipping");
                continue;
            }
            selected.insert(name);
        }

        let graph: BTreeMap<String, Vec<String>> = selected
            .iter()
            .map(|name| {
                let deps = self
                    .registry
                    .get(name)
                    .map(|info| info.manifest.depends)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|dep| selected.contains(dep))
                    .collect();
                (name.clone(), deps)
            })
            .collect();
        let mut order = resolve_load_order(&graph)?;
        if kind == OperationKind::Remove {
            order.reverse();
        }

        let existing = self
            .store
            .list_operations(&OperationFilter::batch(&batch_id))
            .await?
            .len();

        for (index, name) in order.iter().enumerate() {
            let sequence =
                i32::try_from((existing + index + 1) * SEQUENCE_STEP).unwrap_or(i32::MAX);
            self.create_operation(name, kind, &batch_id, sequence, marked_by)
                .await?;
            self.registry.set_state(name, kind.marked_state())?;
        }

        info!(
            batch_id = %batch_id,
            kind = %kind,
            count = order.len(),
            modules = %order.join(", "),
            "marked modules"
        );
        Ok(batch_id)
    }

    /// Run one pending operation to completion.
    async fn execute(&self, mut operation: Operation, executed_by: Option<i64>) -> ModuleResult<()> {
        let module = operation.module_name.clone();

        // Refresh what rollback needs; the registry state captured at mark
        // time is kept because marking changed it.
        let (previous_version, rollback_data) =
            self.capture_prior(&module, operation.previous_state).await?;
        operation.previous_version = previous_version;
        operation.rollback_data = Some(rollback_data);
        operation.executed_by = executed_by;
        operation.start(Utc::now())?;
        self.store.update_operation(&operation).await?;

        info!(
            operation = operation.id,
            batch_id = %operation.batch_id,
            module = %module,
            kind = %operation.kind,
            "executing module operation"
        );

        match self.run(&operation).await {
            Ok(applied) => {
                if let Some(serde_json::Value::Object(data)) = operation.rollback_data.as_mut() {
                    data.insert("applied_migration".into(), json!(applied));
                }
                operation.complete_success(Utc::now())?;
                self.store.update_operation(&operation).await?;

                self.registry
                    .set_state(&module, operation.kind.completed_state())?;
                info!(
                    operation = operation.id,
                    module = %module,
                    duration_ms = ?operation.duration_ms,
                    "module operation succeeded"
                );
                self.registry.hooks().trigger(&HookEvent::new(
                    completion_event(operation.kind),
                    &module,
                    json!({
                        "operation": operation.id,
                        "batch_id": operation.batch_id,
                        "previous_version": operation.previous_version,
                        "migration": applied,
                    }),
                ));
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let trace = format!("{e:?}");
                operation.complete_failure(&message, Some(&trace), Utc::now())?;
                self.store.update_operation(&operation).await?;
                self.restore_registry_state(&operation);
                error!(
                    operation = operation.id,
                    module = %module,
                    error = %message,
                    "module operation failed"
                );
                Err(e)
            }
        }
    }

    /// Do the work of an operation. Returns the migration it applied, if any.
    async fn run(&self, operation: &Operation) -> ModuleResult<Option<String>> {
        let module = operation.module_name.as_str();
        let info = self
            .registry
            .get(module)
            .ok_or_else(|| ModuleError::not_found(module))?;

        let migration = match operation.kind {
            OperationKind::Install => {
                for dep in info.depends() {
                    if !self.registry.is_installed(dep) {
                        return Err(ModuleError::missing_dependency(module, dep));
                    }
                }
                let models = self.models.models(module);
                self.tracker
                    .migrate_module(module, info.version(), &models, MigrationType::Initial)
                    .await?
            }
            OperationKind::Upgrade => {
                // Pick up a manifest replaced on disk since registration.
                self.loader.clear_cache(Some(module));
                let manifest = self.loader.load_manifest(&info.path)?;
                let version = manifest.version.clone();
                self.registry
                    .register(module, (*manifest).clone(), info.path.clone());

                let models = self.models.models(module);
                self.tracker
                    .migrate_module(module, &version, &models, MigrationType::Schema)
                    .await?
            }
            OperationKind::Remove => self.tracker.drop_module(module, info.version()).await?,
        };

        Ok(migration.map(|m| m.migration_name))
    }

    /// Put the registry back to the state recorded when the operation was
    /// marked.
    fn restore_registry_state(&self, operation: &Operation) {
        let state = operation.previous_state.unwrap_or(match operation.kind {
            OperationKind::Install => ModuleState::Uninstalled,
            OperationKind::Upgrade | OperationKind::Remove => ModuleState::Installed,
        });
        if let Err(e) = self.registry.set_state(&operation.module_name, state) {
            warn!(module = %operation.module_name, error = %e, "could not restore module state");
        }
    }
}

/// Hook fired when an operation of `kind` succeeds.
fn completion_event(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Install => hooks::MODULE_INSTALLED,
        OperationKind::Upgrade => hooks::MODULE_UPGRADED,
        OperationKind::Remove => hooks::MODULE_REMOVED,
    }
}

/// Group operations by batch, oldest batch first, keeping each batch's
/// sequence order.
fn order_by_batch(operations: &mut [Operation]) {
    let mut first_seen: HashMap<String, i64> = HashMap::new();
    for op in operations.iter() {
        let first = first_seen.entry(op.batch_id.clone()).or_insert(op.id);
        *first = (*first).min(op.id);
    }
    operations.sort_by_key(|op| {
        let batch = first_seen.get(&op.batch_id).copied().unwrap_or(op.id);
        (batch, op.sequence, op.id)
    });
}

/// Model states captured before the operation ran.
fn previous_states(operation: &Operation) -> ModuleResult<Option<Vec<ModelState>>> {
    let Some(value) = operation
        .rollback_data
        .as_ref()
        .and_then(|data| data.get("previous_states"))
    else {
        return Ok(None);
    };
    let states = serde_json::from_value(value.clone()).map_err(|e| {
        anyhow::Error::new(e).context(format!(
            "operation {} has malformed previous_states",
            operation.id
        ))
    })?;
    Ok(Some(states))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::module::LoaderConfig;
    use crate::schema::executor::{DryRunExecutor, StaticModelProvider};
    use crate::schema::snapshot::{ColumnDef, ModelDefinition, SchemaSnapshot};
    use crate::store::MemoryStore;
    use modhub_test_utils::ModuleTree;

    struct Fixture {
        tree: ModuleTree,
        coordinator: OperationCoordinator,
        executor: Arc<DryRunExecutor>,
        models: Arc<StaticModelProvider>,
    }

    fn table(name: &str) -> ModelDefinition {
        ModelDefinition::new(
            name,
            &format!("t_{name}"),
            SchemaSnapshot::new().with_column(ColumnDef::new("id", "integer").primary_key()),
        )
    }

    fn fixture(modules: &[(&str, &[&str])]) -> Fixture {
        modhub_test_utils::init_tracing();
        let tree = ModuleTree::new();
        let models = Arc::new(StaticModelProvider::new());
        for (name, deps) in modules {
            tree.add_module(name, "1.0", deps);
            models.set(name, vec![table(name)]);
        }
        let loader = Arc::new(ModuleLoader::new(LoaderConfig::with_paths(vec![
            tree.path().to_path_buf(),
        ])));
        let registry = Arc::new(ModuleRegistry::new());

        let executor = Arc::new(DryRunExecutor::new());
        let coordinator = OperationCoordinator::new(
            registry,
            loader,
            Arc::new(MemoryStore::new()),
            executor.clone(),
            models.clone(),
        );
        Fixture {
            tree,
            coordinator,
            executor,
            models,
        }
    }

    fn modules_of(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|op| op.module_name.as_str()).collect()
    }

    #[tokio::test]
    async fn install_pulls_in_dependencies_in_order() {
        let f = fixture(&[("base", &[]), ("crm", &["base"]), ("sales", &["crm"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["sales"], Some(7), None)
            .await
            .unwrap();

        let ops = f.coordinator.batch(&batch).await.unwrap();
        assert_eq!(modules_of(&ops), vec!["base", "crm", "sales"]);
        let sequences: Vec<i32> = ops.iter().map(|op| op.sequence).collect();
        assert_eq!(sequences, vec![10, 20, 30]);
        assert!(ops.iter().all(|op| op.marked_by == Some(7)));
        assert_eq!(
            f.coordinator.registry().state("crm"),
            Some(ModuleState::ToInstall)
        );
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let f = fixture(&[("base", &[])]);
        let err = f
            .coordinator
            .mark_for_install(&["ghost"], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_dependency_on_disk_is_reported() {
        let f = fixture(&[("crm", &["base"])]);
        let err = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::MissingDependency { .. }));
    }

    #[tokio::test]
    async fn remarking_skips_pending_modules() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let first = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        let second = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();

        assert_eq!(f.coordinator.batch(&first).await.unwrap().len(), 2);
        assert!(matches!(
            f.coordinator.batch(&second).await,
            Err(ModuleError::BatchNotFound { .. })
        ));
        assert!(f.coordinator.has_pending_for("base").await.unwrap());
    }

    #[tokio::test]
    async fn apply_installs_and_records_migrations() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();

        let report = f
            .coordinator
            .apply_pending(Some(&batch), Some(1), FailurePolicy::Halt)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.succeeded.len(), 2);

        let registry = f.coordinator.registry();
        assert!(registry.is_installed("base"));
        assert!(registry.is_installed("crm"));

        let ops = f.coordinator.batch(&batch).await.unwrap();
        assert!(ops.iter().all(|op| op.status == OperationStatus::Success));
        assert!(ops.iter().all(|op| op.executed_by == Some(1)));
        assert_eq!(ops[1].applied_migration(), Some("0001_initial"));
        assert!(ops[0].duration_ms.is_some());

        let executed: Vec<String> = f.executor.executed().into_iter().map(|(m, _)| m).collect();
        assert_eq!(executed, vec!["base", "crm"]);
        assert!(!f.coordinator.has_pending_for("crm").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_restores_registry_state() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();

        assert_eq!(f.coordinator.cancel_pending(Some(&batch)).await.unwrap(), 2);
        assert_eq!(
            f.coordinator.registry().state("crm"),
            Some(ModuleState::Uninstalled)
        );
        let ops = f.coordinator.batch(&batch).await.unwrap();
        assert!(ops.iter().all(|op| op.status == OperationStatus::Cancelled));
        assert!(ops.iter().all(|op| op.duration_ms.is_none()));
        assert_eq!(f.coordinator.cancel_pending(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_requires_dependents_in_same_request() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        let err = f
            .coordinator
            .mark_for_remove(&["base"], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidModule { .. }));

        let batch = f
            .coordinator
            .mark_for_remove(&["base", "crm"], None, None)
            .await
            .unwrap();
        let ops = f.coordinator.batch(&batch).await.unwrap();
        assert_eq!(modules_of(&ops), vec!["crm", "base"]);
        assert!(ops.iter().all(|op| op.previous_version.as_deref() == Some("1.0")));
    }

    #[tokio::test]
    async fn dependency_queued_for_removal_blocks_install() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["base"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();
        f.coordinator
            .mark_for_remove(&["base"], None, None)
            .await
            .unwrap();

        let err = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidModule { .. }));
    }

    #[tokio::test]
    async fn upgrade_migrates_changed_models_and_rolls_back() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        f.tree.rewrite_manifest(
            "crm",
            &modhub_test_utils::manifest_toml("crm", "1.1", &[]),
        );
        let mut changed = table("crm");
        changed.snapshot = changed
            .snapshot
            .with_column(ColumnDef::new("score", "integer"));
        f.models.set("crm", vec![changed]);

        let batch = f
            .coordinator
            .mark_for_upgrade(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        let tracker = f.coordinator.tracker();
        assert_eq!(tracker.model_states("crm").await.unwrap()[0].version, "1.1");
        let ops = f.coordinator.batch(&batch).await.unwrap();
        let op = &ops[0];
        assert_eq!(op.previous_version.as_deref(), Some("1.0"));
        assert_eq!(op.applied_migration(), Some("0002_schema"));

        let report = f.coordinator.rollback_batch(&batch).await.unwrap();
        assert_eq!(report.rolled_back, vec![op.id]);
        let states = tracker.model_states("crm").await.unwrap();
        assert_eq!(states[0].version, "1.0");
        assert!(states[0].snapshot.column("score").is_none());
        assert!(f.coordinator.registry().is_installed("crm"));
    }

    #[tokio::test]
    async fn remove_then_rollback_restores_tables() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        let batch = f
            .coordinator
            .mark_for_remove(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();
        let tracker = f.coordinator.tracker();
        assert!(tracker.model_states("crm").await.unwrap().is_empty());
        assert_eq!(
            f.coordinator.registry().state("crm"),
            Some(ModuleState::Uninstalled)
        );

        f.coordinator.rollback_batch(&batch).await.unwrap();
        assert_eq!(tracker.model_states("crm").await.unwrap().len(), 1);
        assert!(f.coordinator.registry().is_installed("crm"));
    }

    #[tokio::test]
    async fn pending_operation_cannot_be_rolled_back() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        let id = f.coordinator.batch(&batch).await.unwrap()[0].id;

        assert!(matches!(
            f.coordinator.rollback_operation(id).await,
            Err(ModuleError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.coordinator.get_operation(999).await,
            Err(ModuleError::OperationNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn manual_lifecycle_measures_duration() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        let id = f.coordinator.batch(&batch).await.unwrap()[0].id;

        assert!(f.coordinator.complete_success(id).await.is_err());
        let started = f.coordinator.start(id, Some(3)).await.unwrap();
        assert_eq!(started.status, OperationStatus::InProgress);
        assert!(f.coordinator.has_pending_for("crm").await.unwrap());

        let done = f
            .coordinator
            .complete_failure(id, "timed out", Some("ddl timeout"))
            .await
            .unwrap();
        assert_eq!(done.status, OperationStatus::Failed);
        assert!(done.duration_ms.is_some());
        assert_eq!(done.error_trace.as_deref(), Some("ddl timeout"));
    }

    #[tokio::test]
    async fn pending_across_batches_keeps_batch_order() {
        let f = fixture(&[("base", &[]), ("crm", &["base"]), ("sales", &["crm"])]);
        let first = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        let second = f
            .coordinator
            .mark_for_install(&["sales"], None, None)
            .await
            .unwrap();
        assert_eq!(
            modules_of(&f.coordinator.batch(&second).await.unwrap()),
            vec!["sales"]
        );

        let pending = f.coordinator.pending(None).await.unwrap();
        assert_eq!(modules_of(&pending), vec!["base", "crm", "sales"]);
        assert_eq!(pending[0].batch_id, first);

        let report = f
            .coordinator
            .apply_pending(None, None, FailurePolicy::Halt)
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(f.coordinator.registry().is_installed("sales"));
    }

    #[tokio::test]
    async fn manual_failure_releases_module_for_remarking() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        let batch = f
            .coordinator
            .mark_for_upgrade(&["crm"], None, None)
            .await
            .unwrap();
        let id = f.coordinator.batch(&batch).await.unwrap()[0].id;
        f.coordinator.start(id, None).await.unwrap();
        assert_eq!(
            f.coordinator.registry().state("crm"),
            Some(ModuleState::ToUpgrade)
        );

        f.coordinator
            .complete_failure(id, "ddl timeout", None)
            .await
            .unwrap();
        assert!(f.coordinator.registry().is_installed("crm"));
        assert!(!f.coordinator.has_pending_for("crm").await.unwrap());
        f.coordinator
            .mark_for_upgrade(&["crm"], None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_success_settles_registry_state() {
        let f = fixture(&[("crm", &[])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        let id = f.coordinator.batch(&batch).await.unwrap()[0].id;

        f.coordinator.start(id, None).await.unwrap();
        f.coordinator.complete_success(id).await.unwrap();
        assert!(f.coordinator.registry().is_installed("crm"));
    }

    #[tokio::test]
    async fn successful_operations_fire_hooks() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for event in [hooks::MODULE_INSTALLED, hooks::MODULE_REMOVED] {
            let log = fired.clone();
            f.coordinator.registry().hooks().register(event, move |e| {
                log.lock().push((e.name.clone(), e.module.clone()));
                Ok(serde_json::Value::Null)
            });
        }

        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();
        let batch = f
            .coordinator
            .mark_for_remove(&["crm"], None, None)
            .await
            .unwrap();
        f.coordinator
            .apply_pending(Some(&batch), None, FailurePolicy::Halt)
            .await
            .unwrap();

        let fired = fired.lock();
        let names: Vec<(&str, &str)> = fired
            .iter()
            .map(|(event, module)| (event.as_str(), module.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("module_installed", "base"),
                ("module_installed", "crm"),
                ("module_removed", "crm"),
            ]
        );
    }

    #[tokio::test]
    async fn recent_batches_lists_counts() {
        let f = fixture(&[("base", &[]), ("crm", &["base"])]);
        let batch = f
            .coordinator
            .mark_for_install(&["crm"], None, None)
            .await
            .unwrap();

        let summaries = f.coordinator.recent_batches(5).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].batch_id, batch);
        assert_eq!(summaries[0].pending, 2);
    }
}
