//! Module discovery, installation and dependency ordering.
//!
//! Modules are directories containing a `manifest.toml` and a `module.wasm`
//! marker. The loader finds them, the registry catalogs them, and the
//! dependency resolver decides the order the host initializes them in.

pub mod archive;
pub mod dependency;
pub mod hooks;
pub mod loader;
pub mod manifest;
pub mod name;
pub mod registry;

pub use archive::{ArchiveSummary, inspect_archive, validate_archive};
pub use dependency::{DependencyGraph, resolve_load_order};
pub use hooks::{HookCallback, HookEvent, HookRegistry};
pub use loader::{LoaderConfig, MARKER_FILE, ModuleLoader};
pub use manifest::{MANIFEST_FILE, MAX_MANIFEST_BYTES, Manifest};
pub use name::is_valid_module_name;
pub use registry::{ModuleInfo, ModuleRegistry, ModuleState};
