//! Module operation types.
//!
//! Status lifecycle:
//!
//! ```text
//! pending ──> in_progress ──> success ──> rolled_back
//!    │                   └──> failed  ──> rolled_back
//!    └──> cancelled
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModuleError, ModuleResult};
use crate::module::ModuleState;

/// What an operation does to its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Upgrade,
    Remove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Upgrade => "upgrade",
            Self::Remove => "remove",
        }
    }

    /// Registry state while an operation of this kind is queued.
    pub fn marked_state(&self) -> ModuleState {
        match self {
            Self::Install => ModuleState::ToInstall,
            Self::Upgrade => ModuleState::ToUpgrade,
            Self::Remove => ModuleState::ToRemove,
        }
    }

    /// Registry state once an operation of this kind has succeeded.
    pub fn completed_state(&self) -> ModuleState {
        match self {
            Self::Install | Self::Upgrade => ModuleState::Installed,
            Self::Remove => ModuleState::Uninstalled,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "upgrade" => Ok(Self::Upgrade),
            "remove" => Ok(Self::Remove),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// Operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued, waiting for apply.
    Pending,

    /// Currently executing.
    InProgress,

    /// Completed successfully.
    Success,

    /// Completed with an error.
    Failed,

    /// Undone after completing.
    RolledBack,

    /// Withdrawn before it started.
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Cancelled)
                | (Self::InProgress, Self::Success)
                | (Self::InProgress, Self::Failed)
                | (Self::Success, Self::RolledBack)
                | (Self::Failed, Self::RolledBack)
        )
    }

    /// Still waiting or running; blocks new intents for the module.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown operation status '{other}'")),
        }
    }
}

/// Input for queueing an operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub batch_id: String,
    pub module_name: String,
    pub kind: OperationKind,
    pub sequence: i32,
    pub marked_by: Option<i64>,
    pub previous_version: Option<String>,
    pub previous_state: Option<ModuleState>,
    pub rollback_data: Option<serde_json::Value>,
}

/// A planned or executed change to one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub batch_id: String,
    pub module_name: String,
    pub kind: OperationKind,
    /// Execution order within the batch.
    pub sequence: i32,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    /// Prior state captured before execution.
    pub rollback_data: Option<serde_json::Value>,
    pub previous_version: Option<String>,
    pub previous_state: Option<ModuleState>,
    pub marked_by: Option<i64>,
    pub executed_by: Option<i64>,
}

impl Operation {
    /// Build a pending operation. The id is assigned by the store.
    pub fn from_new(new: NewOperation, id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            batch_id: new.batch_id,
            module_name: new.module_name,
            kind: new.kind,
            sequence: new.sequence,
            status: OperationStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            error_trace: None,
            rollback_data: new.rollback_data,
            previous_version: new.previous_version,
            previous_state: new.previous_state,
            marked_by: new.marked_by,
            executed_by: None,
        }
    }

    fn transition(&mut self, next: OperationStatus) -> ModuleResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModuleError::transition(
                "operation",
                self.id.to_string(),
                self.status,
                next,
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> ModuleResult<()> {
        self.transition(OperationStatus::InProgress)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn complete_success(&mut self, now: DateTime<Utc>) -> ModuleResult<()> {
        self.transition(OperationStatus::Success)?;
        self.finish(now);
        Ok(())
    }

    pub fn complete_failure(
        &mut self,
        error: &str,
        trace: Option<&str>,
        now: DateTime<Utc>,
    ) -> ModuleResult<()> {
        self.transition(OperationStatus::Failed)?;
        self.error_message = Some(error.to_string());
        self.error_trace = trace.map(str::to_string);
        self.finish(now);
        Ok(())
    }

    pub fn cancel(&mut self) -> ModuleResult<()> {
        self.transition(OperationStatus::Cancelled)
    }

    pub fn mark_rolled_back(&mut self) -> ModuleResult<()> {
        self.transition(OperationStatus::RolledBack)
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
    }

    /// Migration applied by this operation, if any.
    pub fn applied_migration(&self) -> Option<&str> {
        self.rollback_data
            .as_ref()
            .and_then(|data| data.get("applied_migration"))
            .and_then(|v| v.as_str())
    }
}

/// Per-batch status counts for history views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    /// Earliest `created_at` in the batch.
    pub created_at: DateTime<Utc>,
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    /// Summarize one batch's operations. Returns `None` for an empty slice.
    pub fn from_operations(operations: &[Operation]) -> Option<Self> {
        let first = operations.first()?;
        let mut summary = Self {
            batch_id: first.batch_id.clone(),
            created_at: first.created_at,
            ..Self::default()
        };

        for op in operations {
            summary.created_at = summary.created_at.min(op.created_at);
            summary.total += 1;
            match op.status {
                OperationStatus::Pending => summary.pending += 1,
                OperationStatus::InProgress => summary.in_progress += 1,
                OperationStatus::Success => summary.success += 1,
                OperationStatus::Failed => summary.failed += 1,
                OperationStatus::RolledBack => summary.rolled_back += 1,
                OperationStatus::Cancelled => summary.cancelled += 1,
            }
        }
        Some(summary)
    }
}

/// What to do after an operation fails during apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop; later operations stay pending.
    #[default]
    Halt,
    /// Keep going with the next operation.
    Continue,
}

/// Result of applying pending operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Ids of operations that succeeded, in execution order.
    pub succeeded: Vec<i64>,
    /// Ids and error messages of operations that failed.
    pub failed: Vec<(i64, String)>,
    /// Operations left pending after a halt.
    pub remaining: usize,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.remaining == 0
    }
}

/// Result of rolling back a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub rolled_back: Vec<i64>,
    pub errors: Vec<(i64, String)>,
}

/// Fresh 8-character batch id.
pub fn new_batch_id() -> String {
    // The leading bits of a v7 UUID are a timestamp; take the random tail.
    let hex = Uuid::now_v7().simple().to_string();
    hex[hex.len() - 8..].to_string()
}
