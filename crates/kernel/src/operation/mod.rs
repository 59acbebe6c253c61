//! Batched install, upgrade and remove operations.

pub mod coordinator;
pub mod types;

pub use coordinator::OperationCoordinator;
pub use types::{
    ApplyReport, BatchSummary, FailurePolicy, NewOperation, Operation, OperationKind,
    OperationStatus, RollbackReport, new_batch_id,
};
