//! Installed addons of one gear.
//!
//! Populated once from a scan of the gear home when a session starts, then
//! updated explicitly on install and remove.

use super::{is_addon_dir, Addon};
use crate::config::types::{GearError, Result};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct AddonRegistry {
    addons: BTreeMap<String, Addon>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover addon directories directly under `home`
    pub fn scan(home: &Path) -> Result<Self> {
        let mut registry = Self::new();
        let entries = match std::fs::read_dir(home) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(GearError::fs(home, e)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !is_addon_dir(&path) {
                continue;
            }
            let addon = Addon::load(&path);
            if registry.addons.contains_key(&addon.name) {
                log::warn!("Duplicate addon name {} at {}", addon.name, path.display());
                continue;
            }
            registry.addons.insert(addon.name.clone(), addon);
        }

        log::debug!("Found {} addons under {}", registry.addons.len(), home.display());
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Addon> {
        self.addons.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.addons.contains_key(name)
    }

    pub fn insert(&mut self, addon: Addon) {
        self.addons.insert(addon.name.clone(), addon);
    }

    pub fn remove(&mut self, name: &str) -> Option<Addon> {
        self.addons.remove(name)
    }

    /// Every registered addon, valid or not, in name order
    pub fn all(&self) -> impl Iterator<Item = &Addon> {
        self.addons.values()
    }

    /// Valid addons in name order
    pub fn valid(&self) -> impl Iterator<Item = &Addon> {
        self.addons.values().filter(|a| a.valid)
    }

    pub fn framework(&self) -> Option<&Addon> {
        self.valid().find(|a| a.is_framework())
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::{METADATA_DIR, MANIFEST_FILE};
    use std::fs;

    fn addon(home: &Path, dir: &str, manifest: &str) {
        let meta = home.join(dir).join(METADATA_DIR);
        fs::create_dir_all(&meta).unwrap();
        fs::write(meta.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn test_scan_home() {
        let home = tempfile::tempdir().unwrap();
        addon(home.path(), "php", r#"{"name": "php", "type": "framework"}"#);
        addon(home.path(), "mysql", r#"{"name": "mysql"}"#);
        addon(home.path(), "broken", "{");
        addon(home.path(), ".hidden", r#"{"name": "hidden"}"#);
        fs::create_dir(home.path().join("app")).unwrap();

        let registry = AddonRegistry::scan(home.path()).unwrap();
        assert_eq!(registry.len(), 3);
        let names: Vec<&str> = registry.valid().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["mysql", "php"]);
        assert_eq!(registry.framework().map(|a| a.name.as_str()), Some("php"));
        assert!(registry.contains("broken"));
        assert!(!registry.get("broken").unwrap().valid);
    }

    #[test]
    fn test_missing_home_is_empty() {
        let registry = AddonRegistry::scan(Path::new("/nonexistent/gearbox/home")).unwrap();
        assert!(registry.is_empty());
        assert!(registry.framework().is_none());
    }
}
