//! Module discovery and manifest loading.
//!
//! Each search root holds one directory per module:
//!
//! ```text
//! modules/
//!   crm/
//!     manifest.toml
//!     module.wasm
//!   sales/
//!     ...
//! ```
//!
//! A directory is only a module if it has both files and its name passes
//! [`is_valid_module_name`]. Discovery is best-effort: unreadable roots and
//! bad candidates are logged and skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::sync::Cache;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::manifest::{MANIFEST_FILE, MAX_MANIFEST_BYTES, Manifest};
use super::name::is_valid_module_name;
use super::registry::ModuleRegistry;
use crate::error::{ModuleError, ModuleResult};

/// Executable-unit marker every module directory must contain.
pub const MARKER_FILE: &str = "module.wasm";

/// Upper bound on cached manifests.
const MANIFEST_CACHE_CAPACITY: u64 = 1_000;

/// Discovery and archive limits.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Ordered search roots; earlier roots win on duplicate names.
    pub search_paths: Vec<PathBuf>,

    /// Where archives are extracted (default: first search root).
    pub install_dir: Option<PathBuf>,

    /// Maximum manifest size in bytes (default: 100 KB).
    pub max_manifest_bytes: u64,

    /// Maximum number of entries in an uploaded archive (default: 1000).
    pub max_archive_entries: usize,

    /// Maximum total uncompressed archive size (default: 100 MB).
    pub max_archive_bytes: u64,

    /// Maximum length of an archive entry name (default: 255).
    pub max_entry_name_len: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from("./modules")],
            install_dir: None,
            max_manifest_bytes: MAX_MANIFEST_BYTES,
            max_archive_entries: 1_000,
            max_archive_bytes: 100 * 1024 * 1024,
            max_entry_name_len: 255,
        }
    }
}

impl LoaderConfig {
    /// Defaults with the given search roots.
    pub fn with_paths(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            ..Self::default()
        }
    }

    /// Directory that receives extracted archives.
    pub fn managed_root(&self) -> Option<&Path> {
        self.install_dir
            .as_deref()
            .or_else(|| self.search_paths.first().map(PathBuf::as_path))
    }
}

/// Scans search roots and caches what it finds.
pub struct ModuleLoader {
    config: LoaderConfig,
    discovered: RwLock<Option<Arc<BTreeMap<String, PathBuf>>>>,
    manifests: Cache<PathBuf, Arc<Manifest>>,
}

impl ModuleLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            discovered: RwLock::new(None),
            manifests: Cache::builder()
                .max_capacity(MANIFEST_CACHE_CAPACITY)
                .build(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Find every valid module directory, keyed by module name.
    ///
    /// Cached after the first scan; `force` rescans.
    pub fn discover(&self, force: bool) -> Arc<BTreeMap<String, PathBuf>> {
        let cached = if force {
            None
        } else {
            self.discovered.read().clone()
        };
        if let Some(found) = cached {
            return found;
        }

        let found = Arc::new(self.scan());
        *self.discovered.write() = Some(Arc::clone(&found));
        found
    }

    fn scan(&self) -> BTreeMap<String, PathBuf> {
        let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();

        for root in &self.config.search_paths {
            if !root.is_dir() {
                warn!(root = %root.display(), "module search path does not exist, skipping");
                continue;
            }

            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "failed to read module search path");
                    continue;
                }
            };

            let mut children: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            children.sort();

            for dir in children {
                let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                if !is_module_dir(&dir) {
                    continue;
                }

                if !is_valid_module_name(name) {
                    debug!(dir = %dir.display(), "unsafe module directory name, skipping");
                    continue;
                }

                if let Some(existing) = found.get(name) {
                    warn!(
                        module = %name,
                        kept = %existing.display(),
                        ignored = %dir.display(),
                        "duplicate module name, keeping first search path"
                    );
                    continue;
                }

                found.insert(name.to_string(), dir);
            }
        }

        info!(count = found.len(), "discovered modules");
        found
    }

    /// Directory of a discovered module.
    pub fn module_path(&self, name: &str) -> Option<PathBuf> {
        self.discover(false).get(name).cloned()
    }

    /// Like [`module_path`](Self::module_path) but fails with `NotFound`.
    pub fn require_path(&self, name: &str) -> ModuleResult<PathBuf> {
        self.module_path(name)
            .ok_or_else(|| ModuleError::not_found(name))
    }

    /// Parse and validate the manifest in `module_dir`, cached by path.
    pub fn load_manifest(&self, module_dir: &Path) -> ModuleResult<Arc<Manifest>> {
        let key = module_dir.to_path_buf();
        if let Some(manifest) = self.manifests.get(&key) {
            return Ok(manifest);
        }

        let manifest = Arc::new(Manifest::load(
            module_dir,
            self.config.max_manifest_bytes,
        )?);
        self.manifests.insert(key, Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Drop cached manifests (one module's or all) and the discovery result.
    pub fn clear_cache(&self, module: Option<&str>) {
        match module {
            Some(name) => {
                for root in &self.config.search_paths {
                    self.manifests.invalidate(&root.join(name));
                }
                if let Some(root) = &self.config.install_dir {
                    self.manifests.invalidate(&root.join(name));
                }
                let discovered = self
                    .discovered
                    .read()
                    .as_ref()
                    .and_then(|found| found.get(name).cloned());
                if let Some(path) = discovered {
                    self.manifests.invalidate(&path);
                }
            }
            None => self.manifests.invalidate_all(),
        }
        *self.discovered.write() = None;
        debug!(module = ?module, "module caches cleared");
    }

    /// Discover every module, register its manifest, and resolve load order.
    ///
    /// Modules whose manifest fails to load are logged and left out.
    pub fn register_all(&self, registry: &ModuleRegistry) -> ModuleResult<Vec<String>> {
        let found = self.discover(false);

        for (name, path) in found.iter() {
            match self.load_manifest(path) {
                Ok(manifest) => registry.register(name, (*manifest).clone(), path.clone()),
                Err(e) => {
                    warn!(module = %name, error = %e, "failed to load module manifest, skipping");
                }
            }
        }

        let order = registry.resolve_load_order()?;
        info!(count = order.len(), "registered modules");
        Ok(order)
    }

    /// Delete a discovered module's directory and forget it.
    ///
    /// Returns false if no such module was discovered.
    pub fn uninstall_module(&self, name: &str, registry: &ModuleRegistry) -> ModuleResult<bool> {
        let Some(path) = self.module_path(name) else {
            return Ok(false);
        };
        if !path.is_dir() {
            return Ok(false);
        }

        registry.unregister(name);
        std::fs::remove_dir_all(&path)?;
        self.clear_cache(Some(name));

        info!(module = %name, path = %path.display(), "uninstalled module");
        Ok(true)
    }
}

/// Both the manifest and the marker exist as regular files.
pub(crate) fn is_module_dir(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file() && dir.join(MARKER_FILE).is_file()
}
