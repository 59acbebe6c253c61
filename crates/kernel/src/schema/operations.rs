//! Structured schema changes and the planner that derives them.
//!
//! Operations are data, not SQL: the host's [`SchemaExecutor`] decides how to
//! apply them. Every drop carries the definition it removes, so the inverse
//! of any operation can be computed without looking anything up.
//!
//! [`SchemaExecutor`]: super::executor::SchemaExecutor

use serde::{Deserialize, Serialize};

use super::checksum::checksum_of;
use super::snapshot::{ColumnDef, ConstraintDef, ForeignKeyDef, IndexDef, SchemaSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation_type", rename_all = "snake_case")]
pub enum SchemaOperation {
    CreateTable {
        table: String,
        snapshot: SchemaSnapshot,
    },
    DropTable {
        table: String,
        snapshot: SchemaSnapshot,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: ColumnDef,
    },
    AlterColumn {
        table: String,
        from: ColumnDef,
        to: ColumnDef,
    },
    CreateIndex {
        table: String,
        index: IndexDef,
    },
    DropIndex {
        table: String,
        index: IndexDef,
    },
    AddForeignKey {
        table: String,
        foreign_key: ForeignKeyDef,
    },
    DropForeignKey {
        table: String,
        foreign_key: ForeignKeyDef,
    },
    AddConstraint {
        table: String,
        constraint: ConstraintDef,
    },
    DropConstraint {
        table: String,
        constraint: ConstraintDef,
    },
}

impl SchemaOperation {
    /// Table the operation applies to.
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable { table, .. }
            | Self::DropTable { table, .. }
            | Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::CreateIndex { table, .. }
            | Self::DropIndex { table, .. }
            | Self::AddForeignKey { table, .. }
            | Self::DropForeignKey { table, .. }
            | Self::AddConstraint { table, .. }
            | Self::DropConstraint { table, .. } => table,
        }
    }

    /// The operation that undoes this one.
    pub fn inverse(&self) -> Self {
        match self.clone() {
            Self::CreateTable { table, snapshot } => Self::DropTable { table, snapshot },
            Self::DropTable { table, snapshot } => Self::CreateTable { table, snapshot },
            Self::AddColumn { table, column } => Self::DropColumn { table, column },
            Self::DropColumn { table, column } => Self::AddColumn { table, column },
            Self::AlterColumn { table, from, to } => Self::AlterColumn {
                table,
                from: to,
                to: from,
            },
            Self::CreateIndex { table, index } => Self::DropIndex { table, index },
            Self::DropIndex { table, index } => Self::CreateIndex { table, index },
            Self::AddForeignKey { table, foreign_key } => {
                Self::DropForeignKey { table, foreign_key }
            }
            Self::DropForeignKey { table, foreign_key } => {
                Self::AddForeignKey { table, foreign_key }
            }
            Self::AddConstraint { table, constraint } => {
                Self::DropConstraint { table, constraint }
            }
            Self::DropConstraint { table, constraint } => {
                Self::AddConstraint { table, constraint }
            }
        }
    }
}

/// SHA-256 over the canonical JSON of an operation list.
#[allow(clippy::expect_used)]
pub fn operations_checksum(operations: &[SchemaOperation]) -> String {
    checksum_of(operations).expect("schema operations serialize")
}

/// Forward operations and the operations that undo them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePlan {
    pub operations: Vec<SchemaOperation>,
    /// Inverses of `operations`, in reverse order.
    pub rollback_operations: Vec<SchemaOperation>,
}

impl ChangePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append another plan. Its rollback runs before ours.
    pub fn extend(&mut self, other: ChangePlan) {
        self.operations.extend(other.operations);
        let mut rollback = other.rollback_operations;
        rollback.append(&mut self.rollback_operations);
        self.rollback_operations = rollback;
    }

    fn from_operations(operations: Vec<SchemaOperation>) -> Self {
        let rollback_operations = operations.iter().rev().map(SchemaOperation::inverse).collect();
        Self {
            operations,
            rollback_operations,
        }
    }
}

/// Operations that turn `old` into `new` for `table`.
///
/// `None` on one side means the table does not exist there. Dependent
/// objects are dropped before the columns they use and created after.
pub fn plan_changes(
    table: &str,
    old: Option<&SchemaSnapshot>,
    new: Option<&SchemaSnapshot>,
) -> ChangePlan {
    let operations = match (old, new) {
        (None, None) => Vec::new(),
        (None, Some(new)) => vec![SchemaOperation::CreateTable {
            table: table.to_string(),
            snapshot: new.clone(),
        }],
        (Some(old), None) => vec![SchemaOperation::DropTable {
            table: table.to_string(),
            snapshot: old.clone(),
        }],
        (Some(old), Some(new)) => diff(table, old, new),
    };
    ChangePlan::from_operations(operations)
}

/// Operations that remove `table` entirely.
pub fn plan_drop(table: &str, snapshot: &SchemaSnapshot) -> ChangePlan {
    plan_changes(table, Some(snapshot), None)
}

fn diff(table: &str, old: &SchemaSnapshot, new: &SchemaSnapshot) -> Vec<SchemaOperation> {
    let t = || table.to_string();
    let mut ops = Vec::new();

    // Drops first: foreign keys, constraints, indexes, then columns.
    for fk in &old.foreign_keys {
        if new.foreign_keys.iter().find(|f| f.name == fk.name) != Some(fk) {
            ops.push(SchemaOperation::DropForeignKey {
                table: t(),
                foreign_key: fk.clone(),
            });
        }
    }
    for constraint in &old.constraints {
        if new.constraints.iter().find(|c| c.name == constraint.name) != Some(constraint) {
            ops.push(SchemaOperation::DropConstraint {
                table: t(),
                constraint: constraint.clone(),
            });
        }
    }
    for index in &old.indexes {
        if new.indexes.iter().find(|i| i.name == index.name) != Some(index) {
            ops.push(SchemaOperation::DropIndex {
                table: t(),
                index: index.clone(),
            });
        }
    }
    for column in &old.columns {
        if new.column(&column.name).is_none() {
            ops.push(SchemaOperation::DropColumn {
                table: t(),
                column: column.clone(),
            });
        }
    }

    for column in &new.columns {
        match old.column(&column.name) {
            None => ops.push(SchemaOperation::AddColumn {
                table: t(),
                column: column.clone(),
            }),
            Some(previous) if previous != column => ops.push(SchemaOperation::AlterColumn {
                table: t(),
                from: previous.clone(),
                to: column.clone(),
            }),
            Some(_) => {}
        }
    }

    for index in &new.indexes {
        if old.indexes.iter().find(|i| i.name == index.name) != Some(index) {
            ops.push(SchemaOperation::CreateIndex {
                table: t(),
                index: index.clone(),
            });
        }
    }
    for constraint in &new.constraints {
        if old.constraints.iter().find(|c| c.name == constraint.name) != Some(constraint) {
            ops.push(SchemaOperation::AddConstraint {
                table: t(),
                constraint: constraint.clone(),
            });
        }
    }
    for fk in &new.foreign_keys {
        if old.foreign_keys.iter().find(|f| f.name == fk.name) != Some(fk) {
            ops.push(SchemaOperation::AddForeignKey {
                table: t(),
                foreign_key: fk.clone(),
            });
        }
    }

    ops
}
