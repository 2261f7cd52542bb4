//! Addons: installable components living in a gear's home directory.
//!
//! An addon directory is recognized by its `metadata/` subdirectory and
//! described by `metadata/manifest.json`.

pub mod control;
pub mod endpoint;
pub mod files;
pub mod locking;
pub mod registry;
pub mod repository;
pub mod template;

use crate::config::types::{GearError, Result};
use crate::proxy::is_valid_frontend;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use control::AddonControl;
pub use registry::AddonRegistry;

pub const METADATA_DIR: &str = "metadata";
pub const BIN_DIR: &str = "bin";
pub const ENV_DIR: &str = "env";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCKED_FILES: &str = "locked_files";
pub const SHARED_FILES: &str = "shared_files";
/// Legacy shorthand for a shared-files manifest listing only `share`
pub const SHARE_DIR: &str = "share";
/// Source of a framework's initial application
pub const TEMPLATE_DIR: &str = "template";

static ADDON_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid addon name regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonKind {
    /// Application runtime; at most one per gear
    Framework,
    #[default]
    Plain,
}

/// Private network endpoint declared by an addon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub private_ip_name: String,
    pub private_port_name: String,
    pub private_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    name: String,
    #[serde(rename = "type", default)]
    kind: AddonKind,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    proxy_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addon {
    pub name: String,
    pub kind: AddonKind,
    pub path: PathBuf,
    /// Whether the metadata was present and well formed
    pub valid: bool,
    pub endpoints: Vec<Endpoint>,
    /// Frontend path -> backend target
    pub proxy_mappings: BTreeMap<String, String>,
}

/// Environment variable stem derived from an addon name
pub fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

pub fn is_addon_dir(path: &Path) -> bool {
    path.join(METADATA_DIR).is_dir()
}

impl Addon {
    fn read_manifest(path: &Path) -> Result<Manifest> {
        let manifest_path = path.join(METADATA_DIR).join(MANIFEST_FILE);
        let content = match std::fs::read_to_string(&manifest_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GearError::NotFound(format!(
                    "Addon metadata {}",
                    manifest_path.display()
                )));
            }
            Err(e) => return Err(GearError::fs(&manifest_path, e)),
        };
        let manifest: Manifest = serde_json::from_str(&content).map_err(|e| {
            GearError::Config(format!("Invalid manifest {}: {}", manifest_path.display(), e))
        })?;
        if !ADDON_NAME_RE.is_match(&manifest.name) {
            return Err(GearError::Config(format!(
                "Invalid addon name '{}' in {}",
                manifest.name,
                manifest_path.display()
            )));
        }
        if let Some(frontend) = manifest.proxy_mappings.keys().find(|f| !is_valid_frontend(f)) {
            return Err(GearError::Config(format!(
                "Invalid proxy frontend '{}' in {}: must start with '/'",
                frontend,
                manifest_path.display()
            )));
        }
        Ok(manifest)
    }

    /// Load an addon, failing when its metadata is missing or malformed
    pub fn load_valid(path: &Path) -> Result<Self> {
        let manifest = Self::read_manifest(path)?;
        Ok(Self {
            name: manifest.name,
            kind: manifest.kind,
            path: path.to_path_buf(),
            valid: true,
            endpoints: manifest.endpoints,
            proxy_mappings: manifest.proxy_mappings,
        })
    }

    /// Load an addon, marking it invalid instead of failing.
    /// An invalid addon is named after its directory.
    pub fn load(path: &Path) -> Self {
        match Self::load_valid(path) {
            Ok(addon) => addon,
            Err(e) => {
                log::debug!("Invalid addon at {}: {}", path.display(), e);
                Self {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    kind: AddonKind::Plain,
                    path: path.to_path_buf(),
                    valid: false,
                    endpoints: Vec::new(),
                    proxy_mappings: BTreeMap::new(),
                }
            }
        }
    }

    pub fn is_framework(&self) -> bool {
        self.kind == AddonKind::Framework
    }

    pub fn env_name(&self) -> String {
        env_name(&self.name)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.path.join(METADATA_DIR)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join(BIN_DIR)
    }

    pub fn env_dir(&self) -> PathBuf {
        self.path.join(ENV_DIR)
    }

    pub fn template_dir(&self) -> PathBuf {
        self.path.join(TEMPLATE_DIR)
    }

    /// Same addon relocated to `path`
    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path, body: &str) {
        fs::create_dir_all(dir.join(METADATA_DIR)).unwrap();
        fs::write(dir.join(METADATA_DIR).join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn test_load_full_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{
                "name": "php-fpm",
                "type": "framework",
                "endpoints": [{"private_ip_name": "PHP_IP", "private_port_name": "PHP_PORT", "private_port": 9000}],
                "proxy_mappings": {"/": "fcgi://${PHP_IP}:${PHP_PORT}"}
            }"#,
        );

        let addon = Addon::load_valid(dir.path()).unwrap();
        assert_eq!(addon.name, "php-fpm");
        assert!(addon.is_framework());
        assert_eq!(addon.env_name(), "PHP_FPM");
        assert_eq!(addon.endpoints[0].private_port, 9000);
        assert_eq!(addon.proxy_mappings.len(), 1);
    }

    #[test]
    fn test_default_kind_is_plain() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), r#"{"name": "mysql"}"#);
        let addon = Addon::load(dir.path());
        assert!(addon.valid);
        assert_eq!(addon.kind, AddonKind::Plain);
        assert!(addon.endpoints.is_empty());
    }

    #[test]
    fn test_invalid_addons() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        fs::create_dir_all(missing.join(METADATA_DIR)).unwrap();
        assert!(matches!(Addon::load_valid(&missing), Err(GearError::NotFound(_))));
        let addon = Addon::load(&missing);
        assert!(!addon.valid);
        assert_eq!(addon.name, "missing");

        let bad_name = dir.path().join("bad");
        write_manifest(&bad_name, r#"{"name": "../evil"}"#);
        assert!(matches!(Addon::load_valid(&bad_name), Err(GearError::Config(_))));

        let empty = dir.path().join("empty");
        write_manifest(&empty, r#"{"name": ""}"#);
        assert!(!Addon::load(&empty).valid);

        let relative = dir.path().join("relative");
        write_manifest(
            &relative,
            r#"{"name": "php", "proxy_mappings": {"0/": "http://127.0.0.1:8080"}}"#,
        );
        match Addon::load_valid(&relative) {
            Err(GearError::Config(msg)) => assert!(msg.contains("'0/'"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }

        let garbage = dir.path().join("garbage");
        write_manifest(&garbage, "not json");
        assert!(!Addon::load(&garbage).valid);
    }
}
