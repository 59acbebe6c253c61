//! Module installation from uploaded ZIP archives.
//!
//! An archive must hold exactly one top-level directory whose name is a
//! valid module name, with the manifest and marker directly inside it. Every entry is
//! checked before anything touches the disk: no absolute paths, no drive
//! prefixes, no `..` segments, bounded entry count, name length and total
//! size.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use zip::ZipArchive;

use super::loader::{LoaderConfig, MARKER_FILE, ModuleLoader};
use super::manifest::MANIFEST_FILE;
use super::name::is_valid_module_name;
use crate::error::{ModuleError, ModuleResult};

/// What a structurally valid archive contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Name of the single top-level directory.
    pub module_name: String,
    pub entries: usize,
    /// Sum of declared uncompressed sizes.
    pub uncompressed_bytes: u64,
}

fn open_archive(path: &Path) -> ModuleResult<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| ModuleError::archive(path, e))?;
    ZipArchive::new(file).map_err(|e| ModuleError::archive(path, e))
}

/// Check an archive's structure without extracting anything.
pub fn inspect_archive(path: &Path, config: &LoaderConfig) -> ModuleResult<ArchiveSummary> {
    let mut archive = open_archive(path)?;
    inspect_entries(path, &mut archive, config)
}

/// Whether `path` is an installable module archive. Never errors; the
/// reason for a rejection is logged.
pub fn validate_archive(path: &Path, config: &LoaderConfig) -> bool {
    match inspect_archive(path, config) {
        Ok(_) => true,
        Err(e) => {
            warn!(archive = %path.display(), error = %e, "rejected module archive");
            false
        }
    }
}

fn inspect_entries(
    path: &Path,
    archive: &mut ZipArchive<File>,
    config: &LoaderConfig,
) -> ModuleResult<ArchiveSummary> {
    let reject = |reason: String| ModuleError::archive(path, reason);

    if archive.len() > config.max_archive_entries {
        return Err(reject(format!(
            "too many entries ({} > {})",
            archive.len(),
            config.max_archive_entries
        )));
    }

    let mut total: u64 = 0;
    let mut top_level: Option<String> = None;
    let mut has_manifest = false;
    let mut has_marker = false;

    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| ModuleError::archive(path, e))?;
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();

        total = total.saturating_add(entry.size());
        if total > config.max_archive_bytes {
            return Err(reject(format!(
                "uncompressed size exceeds {} bytes",
                config.max_archive_bytes
            )));
        }

        let segments = entry_segments(&name, config.max_entry_name_len).map_err(reject)?;
        let Some(first) = segments.first() else {
            return Err(reject(format!("empty entry name '{name}'")));
        };

        if segments.len() == 1 && !is_dir {
            return Err(reject(format!("file '{name}' is outside the module directory")));
        }

        match &top_level {
            Some(existing) if existing != first => {
                return Err(reject(format!(
                    "more than one top-level directory ('{existing}', '{first}')"
                )));
            }
            Some(_) => {}
            None => top_level = Some(first.clone()),
        }

        if segments.len() == 2 && !is_dir {
            has_manifest |= segments[1] == MANIFEST_FILE;
            has_marker |= segments[1] == MARKER_FILE;
        }
    }

    let Some(module_name) = top_level else {
        return Err(reject("archive is empty".to_string()));
    };
    if !is_valid_module_name(&module_name) {
        return Err(ModuleError::invalid(
            &module_name,
            "archive directory is not a safe module name",
        ));
    }
    if !has_manifest || !has_marker {
        return Err(reject(format!(
            "'{module_name}' must contain {MANIFEST_FILE} and {MARKER_FILE}"
        )));
    }

    Ok(ArchiveSummary {
        module_name,
        entries: archive.len(),
        uncompressed_bytes: total,
    })
}

/// Split an entry name into path segments, rejecting anything that could
/// resolve outside the extraction root.
fn entry_segments(name: &str, max_len: usize) -> Result<Vec<String>, String> {
    if name.len() > max_len {
        return Err(format!("entry name longer than {max_len} bytes"));
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err(format!("absolute path '{name}'"));
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(format!("drive-qualified path '{name}'"));
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(format!("unsupported character in entry name '{name}'"));
    }

    let segments: Vec<String> = name
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect();
    if segments.iter().any(|s| s == "..") {
        return Err(format!("path traversal in '{name}'"));
    }
    Ok(segments)
}

impl ModuleLoader {
    /// See [`validate_archive`].
    pub fn validate_archive(&self, path: &Path) -> bool {
        validate_archive(path, self.config())
    }

    /// Validate and extract a module archive into the managed root.
    ///
    /// An existing module directory of the same name is moved to
    /// `<name>.backup` first and restored if extraction fails. Returns the
    /// installed module name.
    pub fn install_from_archive(&self, path: &Path) -> ModuleResult<String> {
        let mut archive = open_archive(path)?;
        let summary = inspect_entries(path, &mut archive, self.config())?;
        let name = summary.module_name;

        let root = self
            .config()
            .managed_root()
            .ok_or_else(|| ModuleError::invalid(&name, "no module install directory configured"))?
            .to_path_buf();
        std::fs::create_dir_all(&root)?;

        let module_dir = root.join(&name);
        let backup = root.join(format!("{name}.backup"));
        let backed_up = if module_dir.exists() {
            if backup.exists() {
                std::fs::remove_dir_all(&backup)?;
            }
            std::fs::rename(&module_dir, &backup)?;
            info!(module = %name, backup = %backup.display(), "backed up existing module");
            true
        } else {
            false
        };

        if let Err(e) = extract(
            path,
            &mut archive,
            &root,
            &module_dir,
            self.config().max_archive_bytes,
        ) {
            warn!(module = %name, error = %e, "extraction failed, restoring previous state");
            let cleanup = if module_dir.exists() {
                std::fs::remove_dir_all(&module_dir)
            } else {
                Ok(())
            };
            if let Err(cleanup) = cleanup {
                error!(
                    module = %name,
                    path = %module_dir.display(),
                    error = %cleanup,
                    "could not remove partial extraction"
                );
            }
            let restore = if backed_up {
                std::fs::rename(&backup, &module_dir)
            } else {
                Ok(())
            };
            if let Err(restore) = restore {
                error!(
                    module = %name,
                    backup = %backup.display(),
                    error = %restore,
                    "could not restore previous module directory"
                );
            }
            return Err(e);
        }

        self.clear_cache(Some(&name));
        self.discover(true);

        info!(
            module = %name,
            entries = summary.entries,
            bytes = summary.uncompressed_bytes,
            "installed module from archive"
        );
        Ok(name)
    }
}

fn extract(
    path: &Path,
    archive: &mut ZipArchive<File>,
    root: &Path,
    module_dir: &Path,
    max_bytes: u64,
) -> ModuleResult<()> {
    let mut written: u64 = 0;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ModuleError::archive(path, e))?;

        let relative: PathBuf = entry
            .enclosed_name()
            .ok_or_else(|| ModuleError::archive(path, format!("unsafe entry '{}'", entry.name())))?;
        let target = root.join(&relative);
        if !target.starts_with(module_dir) {
            return Err(ModuleError::archive(
                path,
                format!("entry '{}' escapes the module directory", entry.name()),
            ));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Declared sizes can lie; bound what is actually written.
        let budget = max_bytes.saturating_sub(written);
        let mut out = File::create(&target)?;
        let copied = std::io::copy(&mut (&mut entry).take(budget.saturating_add(1)), &mut out)?;
        written += copied;
        if copied > budget {
            return Err(ModuleError::archive(
                path,
                format!("uncompressed size exceeds {max_bytes} bytes"),
            ));
        }

        debug!(file = %target.display(), bytes = copied, "extracted");
    }

    Ok(())
}
