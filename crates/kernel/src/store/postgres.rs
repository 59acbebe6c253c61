//! PostgreSQL store.
//!
//! Tables are created by [`PgModuleStore::ensure_schema`] from
//! `migrations/0001_module_tables.sql`. Enum columns hold the same strings
//! the types render with `as_str`, and operation lists are JSONB.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use super::{ModuleStore, OperationFilter};
use crate::error::{ModuleError, ModuleResult};
use crate::module::ModuleState;
use crate::operation::types::{BatchSummary, NewOperation, Operation};
use crate::schema::migration::{Migration, NewMigration};
use crate::schema::operations::SchemaOperation;
use crate::schema::snapshot::SchemaSnapshot;
use crate::schema::state::ModelState;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_module_tables.sql");

const MIGRATION_COLUMNS: &str = "id, module_name, version, migration_name, migration_type, \
     operations, rollback_operations, checksum, status, description, error_message, \
     created_at, applied_at, rolled_back_at";

const OPERATION_COLUMNS: &str = "id, batch_id, module_name, kind, sequence, status, \
     created_at, started_at, completed_at, duration_ms, error_message, error_trace, \
     rollback_data, previous_version, previous_state, marked_by, executed_by";

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgModuleStore {
    pool: PgPool,
}

impl PgModuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the module tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        // Multiple statements; raw_sql runs them without preparing.
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("failed to create module tables")?;
        Ok(())
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl ModuleStore for PgModuleStore {
    async fn insert_migration(&self, new: NewMigration) -> ModuleResult<Migration> {
        let mut migration = Migration::from_new(new, 0, Utc::now());

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO module_migrations
                (module_name, version, migration_name, migration_type, operations,
                 rollback_operations, checksum, status, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&migration.module_name)
        .bind(&migration.version)
        .bind(&migration.migration_name)
        .bind(migration.migration_type.as_str())
        .bind(Json(&migration.operations))
        .bind(migration.rollback_operations.as_ref().map(Json))
        .bind(&migration.checksum)
        .bind(migration.status.as_str())
        .bind(&migration.description)
        .bind(migration.created_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => {
                migration.id = id;
                Ok(migration)
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(ModuleError::MigrationNameConflict {
                    module: migration.module_name,
                    migration: migration.migration_name,
                })
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context("failed to insert migration")
                .into()),
        }
    }

    async fn get_migration(&self, module: &str, name: &str) -> ModuleResult<Option<Migration>> {
        let row = sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM module_migrations \
             WHERE module_name = $1 AND migration_name = $2"
        ))
        .bind(module)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch migration")?;

        Ok(row.map(Migration::try_from).transpose()?)
    }

    async fn update_migration(&self, migration: &Migration) -> ModuleResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE module_migrations
            SET status = $2, error_message = $3, applied_at = $4, rolled_back_at = $5
            WHERE id = $1
            "#,
        )
        .bind(migration.id)
        .bind(migration.status.as_str())
        .bind(&migration.error_message)
        .bind(migration.applied_at)
        .bind(migration.rolled_back_at)
        .execute(&self.pool)
        .await
        .context("failed to update migration")?;

        if result.rows_affected() == 0 {
            return Err(ModuleError::MigrationNotFound {
                module: migration.module_name.clone(),
                migration: migration.migration_name.clone(),
            });
        }
        Ok(())
    }

    async fn list_migrations(
        &self,
        module: Option<&str>,
        limit: usize,
    ) -> ModuleResult<Vec<Migration>> {
        let rows = sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM module_migrations \
             WHERE ($1::text IS NULL OR module_name = $1) \
             ORDER BY id DESC LIMIT $2"
        ))
        .bind(module)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to list migrations")?;

        Ok(rows
            .into_iter()
            .map(Migration::try_from)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn count_migrations(&self, module: &str) -> ModuleResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM module_migrations WHERE module_name = $1")
                .bind(module)
                .fetch_one(&self.pool)
                .await
                .context("failed to count migrations")?;

        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn model_states(&self, module: &str) -> ModuleResult<Vec<ModelState>> {
        let rows = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT module_name, model_name, table_name, snapshot, checksum, version,
                   last_migration, updated_at
            FROM module_model_states
            WHERE module_name = $1
            ORDER BY model_name
            "#,
        )
        .bind(module)
        .fetch_all(&self.pool)
        .await
        .context("failed to list model states")?;

        Ok(rows
            .into_iter()
            .map(ModelState::try_from)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn model_state(&self, module: &str, model: &str) -> ModuleResult<Option<ModelState>> {
        let row = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT module_name, model_name, table_name, snapshot, checksum, version,
                   last_migration, updated_at
            FROM module_model_states
            WHERE module_name = $1 AND model_name = $2
            "#,
        )
        .bind(module)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch model state")?;

        Ok(row.map(ModelState::try_from).transpose()?)
    }

    async fn replace_model_states(
        &self,
        module: &str,
        states: &[ModelState],
    ) -> ModuleResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        sqlx::query("DELETE FROM module_model_states WHERE module_name = $1")
            .bind(module)
            .execute(&mut *tx)
            .await
            .context("failed to clear model states")?;

        for state in states {
            sqlx::query(
                r#"
                INSERT INTO module_model_states
                    (module_name, model_name, table_name, snapshot, checksum, version,
                     last_migration, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(module)
            .bind(&state.model_name)
            .bind(&state.table_name)
            .bind(Json(&state.snapshot))
            .bind(&state.checksum)
            .bind(&state.version)
            .bind(&state.last_migration)
            .bind(state.updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to store state for model '{}'", state.model_name))?;
        }

        tx.commit().await.context("failed to commit model states")?;
        Ok(())
    }

    async fn delete_model_states(&self, module: &str) -> ModuleResult<u64> {
        let result = sqlx::query("DELETE FROM module_model_states WHERE module_name = $1")
            .bind(module)
            .execute(&self.pool)
            .await
            .context("failed to delete model states")?;
        Ok(result.rows_affected())
    }

    async fn insert_operation(&self, new: NewOperation) -> ModuleResult<Operation> {
        let mut operation = Operation::from_new(new, 0, Utc::now());

        operation.id = sqlx::query_scalar(
            r#"
            INSERT INTO module_operations
                (batch_id, module_name, kind, sequence, status, created_at,
                 rollback_data, previous_version, previous_state, marked_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&operation.batch_id)
        .bind(&operation.module_name)
        .bind(operation.kind.as_str())
        .bind(operation.sequence)
        .bind(operation.status.as_str())
        .bind(operation.created_at)
        .bind(&operation.rollback_data)
        .bind(&operation.previous_version)
        .bind(operation.previous_state.map(|s| s.as_str()))
        .bind(operation.marked_by)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert operation")?;

        Ok(operation)
    }

    async fn get_operation(&self, id: i64) -> ModuleResult<Option<Operation>> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM module_operations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch operation")?;

        Ok(row.map(Operation::try_from).transpose()?)
    }

    async fn update_operation(&self, operation: &Operation) -> ModuleResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE module_operations
            SET status = $2, started_at = $3, completed_at = $4, duration_ms = $5,
                error_message = $6, error_trace = $7, rollback_data = $8,
                previous_version = $9, previous_state = $10, executed_by = $11
            WHERE id = $1
            "#,
        )
        .bind(operation.id)
        .bind(operation.status.as_str())
        .bind(operation.started_at)
        .bind(operation.completed_at)
        .bind(operation.duration_ms)
        .bind(&operation.error_message)
        .bind(&operation.error_trace)
        .bind(&operation.rollback_data)
        .bind(&operation.previous_version)
        .bind(operation.previous_state.map(|s| s.as_str()))
        .bind(operation.executed_by)
        .execute(&self.pool)
        .await
        .context("failed to update operation")?;

        if result.rows_affected() == 0 {
            return Err(ModuleError::OperationNotFound { id: operation.id });
        }
        Ok(())
    }

    async fn list_operations(&self, filter: &OperationFilter) -> ModuleResult<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {OPERATION_COLUMNS} FROM module_operations \
             WHERE ($1::text IS NULL OR batch_id = $1) \
               AND ($2::text IS NULL OR module_name = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY sequence, id"
        ))
        .bind(filter.batch_id.as_deref())
        .bind(filter.module_name.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("failed to list operations")?;

        Ok(rows
            .into_iter()
            .map(Operation::try_from)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn batch_summaries(&self, limit: usize) -> ModuleResult<Vec<BatchSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT batch_id,
                   MIN(created_at) AS created_at,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                   COUNT(*) FILTER (WHERE status = 'success') AS success,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'rolled_back') AS rolled_back,
                   COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM module_operations
            GROUP BY batch_id
            ORDER BY MIN(created_at) DESC, batch_id DESC
            LIMIT $1
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to summarize batches")?;

        Ok(rows.into_iter().map(BatchSummary::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct MigrationRow {
    id: i64,
    module_name: String,
    version: String,
    migration_name: String,
    migration_type: String,
    operations: serde_json::Value,
    rollback_operations: Option<serde_json::Value>,
    checksum: String,
    status: String,
    description: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    applied_at: Option<DateTime<Utc>>,
    rolled_back_at: Option<DateTime<Utc>>,
}

impl TryFrom<MigrationRow> for Migration {
    type Error = anyhow::Error;

    fn try_from(row: MigrationRow) -> anyhow::Result<Self> {
        let operations: Vec<SchemaOperation> = serde_json::from_value(row.operations)
            .with_context(|| format!("bad operations in migration {}", row.id))?;
        let rollback_operations: Option<Vec<SchemaOperation>> = row
            .rollback_operations
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("bad rollback operations in migration {}", row.id))?;

        Ok(Self {
            id: row.id,
            module_name: row.module_name,
            version: row.version,
            migration_name: row.migration_name,
            migration_type: row.migration_type.parse().map_err(|e: String| anyhow!(e))?,
            operations,
            rollback_operations,
            checksum: row.checksum,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            description: row.description,
            error_message: row.error_message,
            created_at: row.created_at,
            applied_at: row.applied_at,
            rolled_back_at: row.rolled_back_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    module_name: String,
    model_name: String,
    table_name: String,
    snapshot: serde_json::Value,
    checksum: String,
    version: String,
    last_migration: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for ModelState {
    type Error = anyhow::Error;

    fn try_from(row: StateRow) -> anyhow::Result<Self> {
        let snapshot: SchemaSnapshot = serde_json::from_value(row.snapshot).with_context(|| {
            format!("bad snapshot for {}/{}", row.module_name, row.model_name)
        })?;

        Ok(Self {
            module_name: row.module_name,
            model_name: row.model_name,
            table_name: row.table_name,
            snapshot,
            checksum: row.checksum,
            version: row.version,
            last_migration: row.last_migration,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: i64,
    batch_id: String,
    module_name: String,
    kind: String,
    sequence: i32,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    error_trace: Option<String>,
    rollback_data: Option<serde_json::Value>,
    previous_version: Option<String>,
    previous_state: Option<String>,
    marked_by: Option<i64>,
    executed_by: Option<i64>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = anyhow::Error;

    fn try_from(row: OperationRow) -> anyhow::Result<Self> {
        let previous_state = row
            .previous_state
            .map(|s| s.parse::<ModuleState>())
            .transpose()
            .map_err(|e| anyhow!(e))?;

        Ok(Self {
            id: row.id,
            batch_id: row.batch_id,
            module_name: row.module_name,
            kind: row.kind.parse().map_err(|e: String| anyhow!(e))?,
            sequence: row.sequence,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
            error_trace: row.error_trace,
            rollback_data: row.rollback_data,
            previous_version: row.previous_version,
            previous_state,
            marked_by: row.marked_by,
            executed_by: row.executed_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    batch_id: String,
    created_at: DateTime<Utc>,
    total: i64,
    pending: i64,
    in_progress: i64,
    success: i64,
    failed: i64,
    rolled_back: i64,
    cancelled: i64,
}

impl From<SummaryRow> for BatchSummary {
    fn from(row: SummaryRow) -> Self {
        let count = |n: i64| usize::try_from(n).unwrap_or_default();
        Self {
            batch_id: row.batch_id,
            created_at: row.created_at,
            total: count(row.total),
            pending: count(row.pending),
            in_progress: count(row.in_progress),
            success: count(row.success),
            failed: count(row.failed),
            rolled_back: count(row.rolled_back),
            cancelled: count(row.cancelled),
        }
    }
}
