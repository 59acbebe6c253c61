//! Parser for module `manifest.toml` files.
//!
//! A manifest is a plain TOML table, so reading one can never execute code.
//! It declares:
//! - name, version, summary and descriptive metadata
//! - depends (other modules that must load first, order preserved)
//! - installable / auto_install flags

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::name::is_valid_module_name;
use crate::error::{ModuleError, ModuleResult};

/// File name of the manifest inside a module directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Manifests larger than this are rejected before parsing.
pub const MAX_MANIFEST_BYTES: u64 = 100 * 1024;

/// Module metadata parsed from `manifest.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Human-readable module name.
    pub name: String,

    /// Module version, at least `major.minor`.
    pub version: String,

    /// Short one-line description.
    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    #[serde(default = "default_category")]
    pub category: String,

    #[serde(default = "default_license")]
    pub license: String,

    /// Modules this one depends on, in declaration order.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Whether the module may be marked for install.
    #[serde(default = "default_installable")]
    pub installable: bool,

    /// Install automatically once all dependencies are installed.
    #[serde(default)]
    pub auto_install: bool,

    /// Full application rather than a technical module.
    #[serde(default)]
    pub application: bool,
}

fn default_category() -> String {
    "Uncategorized".to_string()
}

fn default_license() -> String {
    "MIT".to_string()
}

fn default_installable() -> bool {
    true
}

impl Manifest {
    /// Parse the manifest file inside `module_dir`.
    pub fn load(module_dir: &Path, max_bytes: u64) -> ModuleResult<Self> {
        let module = module_label(module_dir);
        let path = module_dir.join(MANIFEST_FILE);

        let file = std::fs::File::open(&path).map_err(|e| {
            ModuleError::invalid(&module, format!("cannot read {}: {e}", path.display()))
        })?;

        // Read one byte past the limit so oversized files are detected
        // without trusting metadata.
        let mut bytes = Vec::new();
        file.take(max_bytes + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| {
                ModuleError::invalid(&module, format!("cannot read {}: {e}", path.display()))
            })?;
        if bytes.len() as u64 > max_bytes {
            return Err(ModuleError::invalid(
                &module,
                format!("manifest too large (max {} KB)", max_bytes / 1024),
            ));
        }

        let content = String::from_utf8(bytes)
            .map_err(|_| ModuleError::invalid(&module, "manifest is not valid UTF-8"))?;

        Self::parse_str(&content, &module, max_bytes)
    }

    /// Parse a manifest from TOML text.
    pub fn parse_str(content: &str, module: &str, max_bytes: u64) -> ModuleResult<Self> {
        if content.len() as u64 > max_bytes {
            return Err(ModuleError::invalid(
                module,
                format!("manifest too large (max {} KB)", max_bytes / 1024),
            ));
        }

        let mut manifest: Manifest = toml::from_str(content)
            .map_err(|e| ModuleError::invalid(module, format!("invalid manifest: {e}")))?;

        manifest.normalize();
        manifest.validate(module)?;
        Ok(manifest)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> ModuleResult<String> {
        toml::to_string(self).map_err(|e| {
            ModuleError::invalid(&self.name, format!("cannot serialize manifest: {e}"))
        })
    }

    /// Drop duplicate dependencies, keeping the first occurrence.
    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.depends.retain(|dep| seen.insert(dep.clone()));
    }

    fn validate(&self, module: &str) -> ModuleResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModuleError::invalid(module, "manifest has empty 'name' field"));
        }

        let parts: Vec<&str> = self.version.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(ModuleError::invalid(
                module,
                format!(
                    "version '{}' must have at least major.minor format",
                    self.version
                ),
            ));
        }

        for dep in &self.depends {
            if !is_valid_module_name(dep) {
                return Err(ModuleError::invalid(
                    module,
                    format!("dependency '{dep}' is not a valid module name"),
                ));
            }
            if dep == module {
                return Err(ModuleError::invalid(module, "module depends on itself"));
            }
        }

        Ok(())
    }
}

fn module_label(module_dir: &Path) -> String {
    module_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
