//! Module system error types with clear, actionable messages.
//!
//! Every error that crosses the kernel boundary names the module (or the
//! archive, migration or operation) it is about, so callers can translate it
//! into a user-facing response without re-deriving context.

use thiserror::Error;

/// Errors raised by discovery, installation, resolution, schema tracking and
/// batch coordination.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A referenced module is not present in any search path or registry.
    #[error("module '{module}' not found in any search path")]
    NotFound { module: String },

    /// Manifest syntax/size problem, bad archive structure, or unsafe name.
    #[error("module '{module}': {reason}")]
    InvalidModule { module: String, reason: String },

    /// A manifest `depends` entry does not resolve to a registered module.
    #[error("module '{module}': depends on '{dependency}' which is not installed")]
    MissingDependency { module: String, dependency: String },

    /// Load order could not be resolved.
    #[error("circular dependency detected involving modules: {modules}")]
    DependencyCycle { modules: String },

    /// A migration with this idempotency key already exists for the module.
    #[error("module '{module}': migration '{migration}' already exists")]
    MigrationNameConflict { module: String, migration: String },

    /// A new migration repeats the operations of the module's latest live one.
    #[error("module '{module}': migration '{migration}' repeats '{existing}' (checksum {checksum})")]
    MigrationChecksumConflict {
        module: String,
        migration: String,
        existing: String,
        checksum: String,
    },

    /// No migration with this name is recorded for the module.
    #[error("module '{module}': migration '{migration}' not found")]
    MigrationNotFound { module: String, migration: String },

    /// The schema executor rejected a migration.
    #[error("module '{module}': migration '{migration}' failed: {details}")]
    MigrationFailed {
        module: String,
        migration: String,
        details: String,
    },

    /// No operation with this id exists.
    #[error("operation {id} not found")]
    OperationNotFound { id: i64 },

    /// No operations are recorded under this batch id.
    #[error("batch '{batch_id}' not found")]
    BatchNotFound { batch_id: String },

    /// A status change outside the allowed state machine.
    #[error("{entity} '{id}': cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// The uploaded archive could not be read or extracted.
    #[error("archive '{path}': {reason}")]
    Archive { path: String, reason: String },

    /// Filesystem failure while reading or extracting modules.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside a persistence backend.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Result type alias using [`ModuleError`].
pub type ModuleResult<T> = Result<T, ModuleError>;

impl ModuleError {
    /// Create a not-found error.
    pub fn not_found(module: impl Into<String>) -> Self {
        Self::NotFound {
            module: module.into(),
        }
    }

    /// Create an invalid-module error.
    pub fn invalid(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidModule {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing dependency error.
    pub fn missing_dependency(module: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            module: module.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a dependency cycle error listing every unresolved module.
    pub fn cycle(modules: &[String]) -> Self {
        Self::DependencyCycle {
            modules: modules.join(", "),
        }
    }

    /// Create an archive error.
    pub fn archive(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Self::Archive {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid transition error.
    pub fn transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_module() {
        let err = ModuleError::missing_dependency("sales", "crm");
        let msg = err.to_string();
        assert!(msg.contains("sales"));
        assert!(msg.contains("crm"));
    }

    #[test]
    fn cycle_lists_all_modules() {
        let err = ModuleError::cycle(&["a".to_string(), "b".to_string()]);
        assert_eq!(
            err.to_string(),
            "circular dependency detected involving modules: a, b"
        );
    }

    #[test]
    fn transition_shows_both_states() {
        let err = ModuleError::transition("operation", "7", "pending", "rolled_back");
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("rolled_back"));
    }

    #[test]
    fn storage_errors_keep_context_chain() {
        let inner = anyhow::anyhow!("connection refused").context("failed to load operation");
        let err = ModuleError::from(inner);
        let msg = err.to_string();
        assert!(msg.contains("failed to load operation"));
        assert!(msg.contains("connection refused"));
    }
}
