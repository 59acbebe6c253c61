//! modhub test utilities.
//!
//! Fixtures for module system tests: on-disk module trees, ZIP archives
//! (including malicious ones) and a tracing subscriber for test output.
//!
//! Fixtures panic on I/O failure; a broken fixture is a broken test.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// File names a module directory must contain.
pub const MANIFEST_FILE: &str = "manifest.toml";
pub const MARKER_FILE: &str = "module.wasm";

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn` for everything and `debug` for the
/// kernel.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,modhub_kernel=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Render a minimal manifest.
pub fn manifest_toml(name: &str, version: &str, depends: &[&str]) -> String {
    let depends = depends
        .iter()
        .map(|d| format!("\"{d}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "name = \"{name}\"\nversion = \"{version}\"\nsummary = \"{name} module\"\ndepends = [{depends}]\n"
    )
}

/// A temporary search root populated with module directories.
pub struct ModuleTree {
    root: TempDir,
}

impl ModuleTree {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("create temp module root"),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Add a well-formed module directory.
    pub fn add_module(&self, name: &str, version: &str, depends: &[&str]) -> PathBuf {
        self.add_raw(name, &manifest_toml(name, version, depends))
    }

    /// Add a module directory with arbitrary manifest text.
    pub fn add_raw(&self, name: &str, manifest: &str) -> PathBuf {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir).expect("create module dir");
        std::fs::write(dir.join(MANIFEST_FILE), manifest).expect("write manifest");
        std::fs::write(dir.join(MARKER_FILE), b"\0asm\x01\0\0\0").expect("write marker");
        dir
    }

    /// Overwrite a module's manifest in place.
    pub fn rewrite_manifest(&self, name: &str, manifest: &str) {
        std::fs::write(self.root.path().join(name).join(MANIFEST_FILE), manifest)
            .expect("rewrite manifest");
    }
}

impl Default for ModuleTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds ZIP archives entry by entry. Entry names are written verbatim so
/// hostile layouts can be produced.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An archive holding one well-formed module directory.
    pub fn module(name: &str, version: &str, depends: &[&str]) -> Self {
        Self::new()
            .file(
                &format!("{name}/{MANIFEST_FILE}"),
                manifest_toml(name, version, depends).as_bytes(),
            )
            .file(&format!("{name}/{MARKER_FILE}"), b"\0asm\x01\0\0\0")
    }

    /// Add a file entry.
    pub fn file(mut self, name: &str, contents: &[u8]) -> Self {
        self.entries.push((name.to_string(), Some(contents.to_vec())));
        self
    }

    /// Add an explicit directory entry.
    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), None));
        self
    }

    /// Encode the archive.
    pub fn bytes(&self) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for (name, contents) in &self.entries {
            match contents {
                Some(data) => {
                    writer
                        .start_file(name.as_str(), options)
                        .expect("start zip entry");
                    writer.write_all(data).expect("write zip entry");
                }
                None => {
                    writer
                        .add_directory(name.as_str(), options)
                        .expect("add zip directory");
                }
            }
        }

        writer.finish().expect("finish zip").into_inner()
    }

    /// Write the archive to `path` and return it.
    pub fn write_to(&self, path: &Path) -> PathBuf {
        std::fs::write(path, self.bytes()).expect("write zip file");
        path.to_path_buf()
    }
}
