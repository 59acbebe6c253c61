//! Migration records and their status lifecycle.
//!
//! ```text
//! pending ──> applied ──> rolled_back
//!    └──────> failed
//! ```
//!
//! `rolled_back` is terminal; a rolled-back migration never returns to
//! pending. Re-applying the same change needs a new migration name.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operations::{SchemaOperation, operations_checksum};
use crate::error::{ModuleError, ModuleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Schema,
    Data,
    Rollback,
    Initial,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Rollback => "rollback",
            Self::Initial => "initial",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(Self::Schema),
            "data" => Ok(Self::Data),
            "rollback" => Ok(Self::Rollback),
            "initial" => Ok(Self::Initial),
            other => Err(format!("unknown migration type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied)
                | (Self::Pending, Self::Failed)
                | (Self::Applied, Self::RolledBack)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// Input for creating a migration.
#[derive(Debug, Clone)]
pub struct NewMigration {
    pub module_name: String,
    pub version: String,
    pub migration_name: String,
    pub migration_type: MigrationType,
    pub operations: Vec<SchemaOperation>,
    pub rollback_operations: Option<Vec<SchemaOperation>>,
    pub description: Option<String>,
}

/// A recorded migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: i64,
    pub module_name: String,
    pub version: String,
    /// Idempotency key, unique per module.
    pub migration_name: String,
    pub migration_type: MigrationType,
    pub operations: Vec<SchemaOperation>,
    pub rollback_operations: Option<Vec<SchemaOperation>>,
    /// SHA-256 of the canonical JSON of `operations`.
    pub checksum: String,
    pub status: MigrationStatus,
    pub description: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Migration {
    /// Build a pending migration. The id is assigned by the store.
    pub fn from_new(new: NewMigration, id: i64, now: DateTime<Utc>) -> Self {
        let checksum = operations_checksum(&new.operations);
        Self {
            id,
            module_name: new.module_name,
            version: new.version,
            migration_name: new.migration_name,
            migration_type: new.migration_type,
            operations: new.operations,
            rollback_operations: new.rollback_operations,
            checksum,
            status: MigrationStatus::Pending,
            description: new.description,
            error_message: None,
            created_at: now,
            applied_at: None,
            rolled_back_at: None,
        }
    }

    fn transition(&mut self, next: MigrationStatus) -> ModuleResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModuleError::transition(
                "migration",
                format!("{}/{}", self.module_name, self.migration_name),
                self.status,
                next,
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_applied(&mut self, now: DateTime<Utc>) -> ModuleResult<()> {
        self.transition(MigrationStatus::Applied)?;
        self.applied_at = Some(now);
        self.error_message = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str) -> ModuleResult<()> {
        self.transition(MigrationStatus::Failed)?;
        self.error_message = Some(error.to_string());
        Ok(())
    }

    pub fn mark_rolled_back(&mut self, now: DateTime<Utc>) -> ModuleResult<()> {
        self.transition(MigrationStatus::RolledBack)?;
        self.rolled_back_at = Some(now);
        Ok(())
    }
}

/// `0003_schema`-style name for the `sequence`th migration of a module.
pub fn migration_name(sequence: usize, suffix: &str) -> String {
    format!("{sequence:04}_{suffix}")
}
