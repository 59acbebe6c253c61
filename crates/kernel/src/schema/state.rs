//! Last-applied model state and drift detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::{ModelDefinition, SchemaSnapshot};

/// What was last applied for one (module, model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState {
    pub module_name: String,
    pub model_name: String,
    pub table_name: String,
    pub snapshot: SchemaSnapshot,
    pub checksum: String,
    pub version: String,
    pub last_migration: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ModelState {
    pub fn from_definition(
        module: &str,
        model: &ModelDefinition,
        version: &str,
        migration: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            module_name: module.to_string(),
            model_name: model.name.clone(),
            table_name: model.table_name.clone(),
            snapshot: model.snapshot.clone(),
            checksum: model.checksum(),
            version: version.to_string(),
            last_migration: migration.map(str::to_string),
            updated_at: now,
        }
    }

    /// The declared model this state was recorded from.
    pub fn definition(&self) -> ModelDefinition {
        ModelDefinition::new(&self.model_name, &self.table_name, self.snapshot.clone())
    }
}

/// Outcome of comparing one model against its stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub module_name: String,
    pub model_name: String,
    pub table_name: String,
    pub current_checksum: String,
    /// `None` when nothing was ever recorded.
    pub stored_checksum: Option<String>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        self.stored_checksum.as_deref() != Some(self.current_checksum.as_str())
    }
}

/// Compare a declared model with its stored state. Missing state is drift;
/// so is a table rename.
pub fn detect_drift(module: &str, model: &ModelDefinition, stored: Option<&ModelState>) -> DriftReport {
    let current_checksum = model.checksum();
    let stored_checksum = stored.map(|s| {
        if s.table_name == model.table_name {
            s.checksum.clone()
        } else {
            format!("{}:{}", s.table_name, s.checksum)
        }
    });

    DriftReport {
        module_name: module.to_string(),
        model_name: model.name.clone(),
        table_name: model.table_name.clone(),
        current_checksum,
        stored_checksum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::snapshot::ColumnDef;

    fn lead(extra: bool) -> ModelDefinition {
        let mut snapshot = SchemaSnapshot::new().with_column(ColumnDef::new("id", "integer"));
        if extra {
            snapshot = snapshot.with_column(ColumnDef::new("score", "integer"));
        }
        ModelDefinition::new("lead", "crm_lead", snapshot)
    }

    #[test]
    fn missing_state_is_drift() {
        let report = detect_drift("crm", &lead(false), None);
        assert!(report.has_drift());
        assert!(report.stored_checksum.is_none());
    }

    #[test]
    fn state_compared_to_itself_has_no_drift() {
        let state = ModelState::from_definition("crm", &lead(false), "1.0", None, Utc::now());
        let report = detect_drift("crm", &state.definition(), Some(&state));
        assert!(!report.has_drift());
    }

    #[test]
    fn changed_model_drifts() {
        let state = ModelState::from_definition("crm", &lead(false), "1.0", None, Utc::now());
        assert!(detect_drift("crm", &lead(true), Some(&state)).has_drift());
    }

    #[test]
    fn renamed_table_drifts() {
        let state = ModelState::from_definition("crm", &lead(false), "1.0", None, Utc::now());
        let renamed = ModelDefinition::new("lead", "crm_lead_v2", lead(false).snapshot);
        assert!(detect_drift("crm", &renamed, Some(&state)).has_drift());
    }
}
