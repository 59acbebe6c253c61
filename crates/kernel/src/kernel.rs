//! Wiring of the module subsystem for a host process.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::KernelConfig;
use crate::db;
use crate::error::ModuleResult;
use crate::module::{ModuleLoader, ModuleRegistry, ModuleState};
use crate::operation::OperationCoordinator;
use crate::schema::executor::{ModelProvider, SchemaExecutor};
use crate::store::ModuleStore;

/// Loader, registry, store and coordinator sharing one configuration.
#[derive(Clone)]
pub struct ModuleKernel {
    loader: Arc<ModuleLoader>,
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn ModuleStore>,
    coordinator: Arc<OperationCoordinator>,
}

impl ModuleKernel {
    /// Open the configured store and register every discovered module.
    pub async fn boot(
        config: &KernelConfig,
        executor: Arc<dyn SchemaExecutor>,
        models: Arc<dyn ModelProvider>,
    ) -> Result<Self> {
        let store = db::open_store(config)
            .await
            .context("failed to open module store")?;
        let kernel = Self::with_store(config, store, executor, models);

        match kernel.loader.register_all(&kernel.registry) {
            Ok(order) => info!(modules = %order.join(", "), "module load order resolved"),
            Err(e) => warn!(error = %e, "modules registered without a load order"),
        }
        Ok(kernel)
    }

    /// Assemble around an existing store without touching the filesystem.
    pub fn with_store(
        config: &KernelConfig,
        store: Arc<dyn ModuleStore>,
        executor: Arc<dyn SchemaExecutor>,
        models: Arc<dyn ModelProvider>,
    ) -> Self {
        let loader = Arc::new(ModuleLoader::new(config.loader_config()));
        let registry = Arc::new(ModuleRegistry::new());
        let coordinator = Arc::new(OperationCoordinator::new(
            registry.clone(),
            loader.clone(),
            store.clone(),
            executor,
            models,
        ));
        Self {
            loader,
            registry,
            store,
            coordinator,
        }
    }

    pub fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ModuleStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<OperationCoordinator> {
        &self.coordinator
    }

    /// Extract an uploaded archive and register the module it contains.
    ///
    /// The module is left uninstalled; mark it for install to activate it.
    pub fn install_archive(&self, path: &Path) -> ModuleResult<String> {
        let name = self.loader.install_from_archive(path)?;
        let module_dir = self.loader.require_path(&name)?;
        let manifest = self.loader.load_manifest(&module_dir)?;
        self.registry.register(&name, (*manifest).clone(), module_dir);
        Ok(name)
    }

    /// Queue installs for uninstalled `auto_install` modules whose
    /// dependencies are all installed.
    ///
    /// Returns `None` when there is nothing to install.
    pub async fn mark_auto_install(&self, marked_by: Option<i64>) -> ModuleResult<Option<String>> {
        let candidates: Vec<String> = self
            .registry
            .all()
            .into_iter()
            .filter(|info| info.manifest.auto_install && info.manifest.installable)
            .filter(|info| info.state == ModuleState::Uninstalled)
            .filter(|info| info.depends().iter().all(|d| self.registry.is_installed(d)))
            .map(|info| info.name)
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }
        let names: Vec<&str> = candidates.iter().map(String::as_str).collect();
        let batch_id = self
            .coordinator
            .mark_for_install(&names, marked_by, None)
            .await?;
        Ok(Some(batch_id))
    }
}
