//! modhub kernel library.
//!
//! Module management for a host application: discovery of module
//! directories, installation from uploaded archives, dependency-ordered load
//! resolution, schema drift tracking with migrations, and batched
//! install/upgrade/remove operations with rollback.
//!
//! Hosts usually start from [`ModuleKernel::boot`]; the individual pieces
//! are public for hosts that wire them differently.

pub mod config;
pub mod db;
pub mod error;
pub mod kernel;
pub mod module;
pub mod operation;
pub mod schema;
pub mod store;

pub use config::KernelConfig;
pub use error::{ModuleError, ModuleResult};
pub use kernel::ModuleKernel;
pub use module::{LoaderConfig, Manifest, ModuleInfo, ModuleLoader, ModuleRegistry, ModuleState};
pub use operation::{FailurePolicy, OperationCoordinator, OperationKind, OperationStatus};
pub use schema::{ModelDefinition, ModelProvider, SchemaExecutor, SchemaSnapshot, SchemaTracker};
pub use store::{MemoryStore, ModuleStore, PgModuleStore};
