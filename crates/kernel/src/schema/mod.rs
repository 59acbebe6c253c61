//! Schema state tracking.
//!
//! Modules declare their data model as [`ModelDefinition`]s. The tracker keeps
//! the last-applied snapshot of every model, detects drift by checksum, and
//! records each change as a named [`Migration`] with rollback operations.

pub mod checksum;
pub mod executor;
pub mod migration;
pub mod operations;
pub mod snapshot;
pub mod state;
pub mod tracker;

pub use executor::{DryRunExecutor, ModelProvider, SchemaExecutor, StaticModelProvider};
pub use migration::{Migration, MigrationStatus, MigrationType, NewMigration};
pub use operations::{ChangePlan, SchemaOperation, plan_changes, plan_drop};
pub use snapshot::{ColumnDef, ConstraintDef, ForeignKeyDef, IndexDef, ModelDefinition, SchemaSnapshot};
pub use state::{DriftReport, ModelState, detect_drift};
pub use tracker::SchemaTracker;
