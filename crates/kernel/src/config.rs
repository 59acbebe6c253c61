//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::module::LoaderConfig;

/// Kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Module search roots in priority order (default: ./modules).
    pub module_paths: Vec<PathBuf>,

    /// Where archives are extracted (default: first search root).
    pub install_dir: Option<PathBuf>,

    /// PostgreSQL connection URL. Without it the in-memory store is used.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 5).
    pub database_max_connections: u32,
}

impl KernelConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let module_paths: Vec<PathBuf> = lookup("MODULE_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        let module_paths = if module_paths.is_empty() {
            vec![PathBuf::from("./modules")]
        } else {
            module_paths
        };

        let install_dir = lookup("MODULE_INSTALL_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let database_max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|| "5".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        Ok(Self {
            module_paths,
            install_dir,
            database_url,
            database_max_connections,
        })
    }

    /// Loader settings for these search roots, with default limits.
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            install_dir: self.install_dir.clone(),
            ..LoaderConfig::with_paths(self.module_paths.clone())
        }
    }
}
