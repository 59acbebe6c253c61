//! Catalog of known modules and their install state.
//!
//! The registry is usually passed explicitly to the components that need it.
//! A process-wide instance is available through [`ModuleRegistry::global`]
//! for hosts that want a single shared catalog.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::dependency::{self, DependencyGraph};
use super::hooks::{HookEvent, HookRegistry};
use super::manifest::Manifest;
use crate::error::{ModuleError, ModuleResult};

/// Lifecycle state of a module as seen by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    #[default]
    Uninstalled,
    Installed,
    ToInstall,
    ToUpgrade,
    ToRemove,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::ToInstall => "to_install",
            Self::ToUpgrade => "to_upgrade",
            Self::ToRemove => "to_remove",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninstalled" => Ok(Self::Uninstalled),
            "installed" => Ok(Self::Installed),
            "to_install" => Ok(Self::ToInstall),
            "to_upgrade" => Ok(Self::ToUpgrade),
            "to_remove" => Ok(Self::ToRemove),
            other => Err(format!("unknown module state '{other}'")),
        }
    }
}

/// A registered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Directory name, unique across the registry.
    pub name: String,
    pub manifest: Manifest,
    pub path: PathBuf,
    pub state: ModuleState,
}

impl ModuleInfo {
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn depends(&self) -> &[String] {
        &self.manifest.depends
    }
}

#[derive(Default)]
struct RegistryInner {
    modules: BTreeMap<String, ModuleInfo>,
    /// Last successful resolution; cleared whenever the module set changes.
    load_order: Option<Vec<String>>,
}

/// Thread-safe module catalog.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
    hooks: HookRegistry,
}

static GLOBAL: LazyLock<Arc<ModuleRegistry>> = LazyLock::new(|| Arc::new(ModuleRegistry::new()));

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<ModuleRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Insert or replace a module. An existing entry keeps its state.
    pub fn register(&self, name: &str, manifest: Manifest, path: PathBuf) {
        let mut inner = self.inner.write();
        let state = match inner.modules.get(name) {
            Some(existing) => {
                debug!(module = %name, path = %path.display(), "replacing registered module");
                existing.state
            }
            None => {
                debug!(module = %name, version = %manifest.version, "registered module");
                ModuleState::Uninstalled
            }
        };

        inner.modules.insert(
            name.to_string(),
            ModuleInfo {
                name: name.to_string(),
                manifest,
                path,
                state,
            },
        );
        inner.load_order = None;
    }

    /// Remove a module from the catalog.
    pub fn unregister(&self, name: &str) -> Option<ModuleInfo> {
        let mut inner = self.inner.write();
        let removed = inner.modules.remove(name);
        if removed.is_some() {
            inner.load_order = None;
            debug!(module = %name, "unregistered module");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<ModuleInfo> {
        self.inner.read().modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().modules.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().modules.keys().cloned().collect()
    }

    /// All modules, in the last resolved load order if there is one,
    /// otherwise sorted by name.
    pub fn all(&self) -> Vec<ModuleInfo> {
        let inner = self.inner.read();
        match &inner.load_order {
            Some(order) => order
                .iter()
                .filter_map(|name| inner.modules.get(name).cloned())
                .collect(),
            None => inner.modules.values().cloned().collect(),
        }
    }

    /// Adjacency map of every registered module's `depends`.
    pub fn graph(&self) -> DependencyGraph {
        self.inner
            .read()
            .modules
            .iter()
            .map(|(name, info)| (name.clone(), info.manifest.depends.clone()))
            .collect()
    }

    /// Declared dependencies of `name`; with `recursive`, the full transitive
    /// closure sorted by name.
    pub fn dependencies(&self, name: &str, recursive: bool) -> ModuleResult<Vec<String>> {
        let info = self.get(name).ok_or_else(|| ModuleError::not_found(name))?;
        if !recursive {
            return Ok(info.manifest.depends);
        }
        Ok(dependency::transitive_dependencies(&self.graph(), name)
            .into_iter()
            .collect())
    }

    /// Modules that directly depend on `name`, sorted.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        dependency::direct_dependents(&self.graph(), name)
    }

    /// Dependencies of `name` that are not registered.
    pub fn missing_dependencies(&self, name: &str) -> ModuleResult<Vec<String>> {
        let inner = self.inner.read();
        let info = inner
            .modules
            .get(name)
            .ok_or_else(|| ModuleError::not_found(name))?;
        let available: HashSet<String> = inner.modules.keys().cloned().collect();
        Ok(dependency::missing_dependencies(
            &info.manifest.depends,
            &available,
        ))
    }

    /// Fail with [`ModuleError::MissingDependency`] if `name` depends on an
    /// unregistered module.
    pub fn check_dependencies(&self, name: &str) -> ModuleResult<()> {
        match self.missing_dependencies(name)?.into_iter().next() {
            Some(dep) => Err(ModuleError::missing_dependency(name, dep)),
            None => Ok(()),
        }
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.inner.read().modules.get(name).map(|info| info.state)
    }

    /// Update a module's state, returning the previous one.
    ///
    /// An actual change fires
    /// [`MODULE_STATE_CHANGED`](super::hooks::MODULE_STATE_CHANGED) once the
    /// registry lock is released.
    pub fn set_state(&self, name: &str, state: ModuleState) -> ModuleResult<ModuleState> {
        let previous = {
            let mut inner = self.inner.write();
            let info = inner
                .modules
                .get_mut(name)
                .ok_or_else(|| ModuleError::not_found(name))?;
            std::mem::replace(&mut info.state, state)
        };
        if previous != state {
            debug!(module = %name, from = %previous, to = %state, "module state changed");
            self.hooks
                .trigger(&HookEvent::state_changed(name, previous, state));
        }
        Ok(previous)
    }

    /// Event callbacks attached to this registry.
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.state(name) == Some(ModuleState::Installed)
    }

    /// Installed module names, sorted.
    pub fn installed(&self) -> Vec<String> {
        self.inner
            .read()
            .modules
            .values()
            .filter(|info| info.state == ModuleState::Installed)
            .map(|info| info.name.clone())
            .collect()
    }

    /// Compute the dependency-respecting load order of every registered
    /// module and remember it for [`all`](Self::all).
    pub fn resolve_load_order(&self) -> ModuleResult<Vec<String>> {
        let order = dependency::resolve_load_order(&self.graph())?;
        self.inner.write().load_order = Some(order.clone());
        debug!(count = order.len(), "resolved module load order");
        Ok(order)
    }

    /// Drop every registered module and hook.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.write();
            inner.modules.clear();
            inner.load_order = None;
        }
        self.hooks.clear();
        info!("module registry reset");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::module::manifest::MAX_MANIFEST_BYTES;

    fn manifest(name: &str, deps: &[&str]) -> Manifest {
        let depends = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!("name = \"{name}\"\nversion = \"1.0\"\ndepends = [{depends}]\n");
        Manifest::parse_str(&toml, name, MAX_MANIFEST_BYTES).unwrap()
    }

    fn registry(entries: &[(&str, &[&str])]) -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        for (name, deps) in entries {
            registry.register(name, manifest(name, deps), PathBuf::from(format!("/m/{name}")));
        }
        registry
    }

    #[test]
    fn register_is_an_upsert_that_keeps_state() {
        let registry = registry(&[("crm", &[])]);
        registry.set_state("crm", ModuleState::Installed).unwrap();

        registry.register("crm", manifest("crm", &[]), PathBuf::from("/other/crm"));

        let info = registry.get("crm").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(info.path, PathBuf::from("/other/crm"));
        assert_eq!(info.state, ModuleState::Installed);
    }

    #[test]
    fn resolve_places_dependencies_first() {
        let registry = registry(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert_eq!(registry.resolve_load_order().unwrap(), vec!["c", "b", "a"]);

        let names: Vec<String> = registry.all().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    #[test]
    fn resolve_fails_on_cycle() {
        let registry = registry(&[("a", &["b"]), ("b", &["a"])]);
        let err = registry.resolve_load_order().unwrap_err();
        assert!(matches!(err, ModuleError::DependencyCycle { .. }));
    }

    #[test]
    fn membership_change_forgets_load_order() {
        let registry = registry(&[("b", &[]), ("a", &["b"])]);
        registry.resolve_load_order().unwrap();
        registry.register("c", manifest("c", &[]), PathBuf::from("/m/c"));

        let names: Vec<String> = registry.all().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_and_dependents() {
        let registry = registry(&[
            ("base", &[]),
            ("crm", &["base"]),
            ("sales", &["crm"]),
            ("hr", &["base"]),
        ]);

        assert_eq!(registry.dependencies("sales", false).unwrap(), vec!["crm"]);
        assert_eq!(
            registry.dependencies("sales", true).unwrap(),
            vec!["base", "crm"]
        );
        assert_eq!(registry.dependents("base"), vec!["crm", "hr"]);
        assert!(registry.dependents("sales").is_empty());
        assert!(matches!(
            registry.dependencies("ghost", false),
            Err(ModuleError::NotFound { .. })
        ));
    }

    #[test]
    fn missing_dependencies_are_reported() {
        let registry = registry(&[("sales", &["crm", "base"]), ("base", &[])]);
        assert_eq!(registry.missing_dependencies("sales").unwrap(), vec!["crm"]);
        assert!(matches!(
            registry.check_dependencies("sales"),
            Err(ModuleError::MissingDependency { .. })
        ));
        assert!(registry.check_dependencies("base").is_ok());
    }

    #[test]
    fn state_tracking() {
        let registry = registry(&[("crm", &[]), ("sales", &["crm"])]);
        assert_eq!(registry.state("crm"), Some(ModuleState::Uninstalled));

        let previous = registry.set_state("crm", ModuleState::Installed).unwrap();
        assert_eq!(previous, ModuleState::Uninstalled);
        assert!(registry.is_installed("crm"));
        assert_eq!(registry.installed(), vec!["crm"]);

        assert!(registry.set_state("ghost", ModuleState::Installed).is_err());
    }

    #[test]
    fn unregister_and_reset() {
        let registry = registry(&[("crm", &[]), ("sales", &["crm"])]);
        assert!(registry.unregister("crm").is_some());
        assert!(registry.unregister("crm").is_none());
        assert!(!registry.contains("crm"));

        registry.reset();
        assert!(registry.is_empty());
    }

    #[test]
    fn state_change_fires_hook_after_releasing_lock() {
        let registry = Arc::new(registry(&[("crm", &[])]));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let (reader, log) = (registry.clone(), seen.clone());
        registry
            .hooks()
            .register(crate::module::hooks::MODULE_STATE_CHANGED, move |event| {
                log.lock().push((event.data.clone(), reader.state(&event.module)));
                Ok(serde_json::Value::Null)
            });

        registry.set_state("crm", ModuleState::ToInstall).unwrap();
        registry.set_state("crm", ModuleState::ToInstall).unwrap();
        registry.set_state("crm", ModuleState::Installed).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].0["from"], "to_install");
        assert_eq!(seen[1].1, Some(ModuleState::Installed));
    }

    #[test]
    fn reset_drops_hooks() {
        let registry = registry(&[("crm", &[])]);
        registry
            .hooks()
            .register("module_installed", |_| Ok(serde_json::Value::Null));
        registry.reset();
        assert!(!registry.hooks().has_hook("module_installed"));
    }

    #[test]
    fn module_state_parses_its_own_output() {
        for state in [
            ModuleState::Uninstalled,
            ModuleState::Installed,
            ModuleState::ToInstall,
            ModuleState::ToUpgrade,
            ModuleState::ToRemove,
        ] {
            assert_eq!(state.as_str().parse::<ModuleState>().unwrap(), state);
        }
        assert!("bogus".parse::<ModuleState>().is_err());
    }

    #[test]
    fn global_registry_is_shared() {
        let a = ModuleRegistry::global();
        let b = ModuleRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
