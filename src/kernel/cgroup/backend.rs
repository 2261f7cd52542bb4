//! Cgroup backend abstraction for v1/v2 dual support.
//!
//! Parameters are always given with v1 key names (`memory.limit_in_bytes`,
//! `cpu.shares`, ...); the v2 backend translates them. Every backend persists
//! what it applied so that `restore` can rebuild the group after a reboot.

use crate::config::settings::CgroupSettings;
use crate::config::types::{GearError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Values at or above this are the kernel's "unlimited" marker on v1
const V1_UNLIMITED: u64 = 1 << 62;

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Create the group and apply parameters
    fn create(&self, gear_id: &str, params: &BTreeMap<String, String>) -> Result<()>;
    /// Remove the group and its persisted state; absence is not an error
    fn delete(&self, gear_id: &str) -> Result<()>;
    fn freeze(&self, gear_id: &str) -> Result<()>;
    fn thaw(&self, gear_id: &str) -> Result<()>;
    /// Pids currently in the group
    fn tasks(&self, gear_id: &str) -> Result<Vec<i32>>;
    /// Read one parameter by its v1 name
    fn fetch(&self, gear_id: &str, key: &str) -> Result<Option<String>>;
    /// Memory limit in bytes, `None` when unlimited
    fn memory_limit(&self, gear_id: &str) -> Result<Option<u64>>;
    /// Re-create the group from persisted state
    fn restore(&self, gear_id: &str) -> Result<()>;
    fn get_cgroup_path(&self, gear_id: &str) -> PathBuf;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CgroupBackendType {
    V1,
    V2,
}

/// What a backend applied to a gear's group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgroupState {
    pub params: BTreeMap<String, String>,
    pub frozen: bool,
}

/// `<state_dir>/<gear>.json` snapshots
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self, gear_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", gear_id))
    }

    pub fn load(&self, gear_id: &str) -> Result<Option<CgroupState>> {
        let path = self.path(gear_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GearError::fs(&path, e)),
        }
    }

    pub fn save(&self, gear_id: &str, state: &CgroupState) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| GearError::fs(&self.dir, e))?;
        let path = self.path(gear_id);
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&path, json).map_err(|e| GearError::fs(&path, e))
    }

    /// Update only the freezer flag of an existing snapshot
    pub fn set_frozen(&self, gear_id: &str, frozen: bool) -> Result<()> {
        if let Some(mut state) = self.load(gear_id)? {
            state.frozen = frozen;
            self.save(gear_id, &state)?;
        }
        Ok(())
    }

    pub fn remove(&self, gear_id: &str) -> Result<()> {
        let path = self.path(gear_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GearError::fs(&path, e)),
        }
    }
}

pub(crate) fn write_param(dir: &Path, key: &str, value: &str) -> Result<()> {
    let path = dir.join(key);
    std::fs::write(&path, value)
        .map_err(|e| GearError::Cgroup(format!("Failed to write {}: {}", path.display(), e)))
}

/// Read a control file; a missing file reads as `None`
pub(crate) fn read_param(dir: &Path, key: &str) -> Result<Option<String>> {
    let path = dir.join(key);
    match std::fs::read_to_string(&path) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GearError::Cgroup(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Parse a pid list file (`tasks`, `cgroup.procs`)
pub(crate) fn read_pids(dir: &Path, file: &str) -> Result<Vec<i32>> {
    let content = read_param(dir, file)?.unwrap_or_default();
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Remove an (empty) cgroup directory; absence is not an error
pub(crate) fn remove_group_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GearError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            dir.display(),
            e
        ))),
    }
}

/// Parse a memory limit value, mapping the unlimited markers to `None`
pub fn parse_memory_limit(value: &str) -> Result<Option<u64>> {
    let value = value.trim();
    if value == "max" {
        return Ok(None);
    }
    let bytes: u64 = value
        .parse()
        .map_err(|_| GearError::Cgroup(format!("Invalid memory limit '{}'", value)))?;
    Ok(if bytes >= V1_UNLIMITED { None } else { Some(bytes) })
}

/// Backend used when cgroups are disabled or unavailable: every operation succeeds
/// and no process is ever reported as a member.
pub struct DisabledCgroup;

impl CgroupBackend for DisabledCgroup {
    fn backend_name(&self) -> &str {
        "disabled"
    }
    fn create(&self, _gear_id: &str, _params: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }
    fn delete(&self, _gear_id: &str) -> Result<()> {
        Ok(())
    }
    fn freeze(&self, _gear_id: &str) -> Result<()> {
        Ok(())
    }
    fn thaw(&self, _gear_id: &str) -> Result<()> {
        Ok(())
    }
    fn tasks(&self, _gear_id: &str) -> Result<Vec<i32>> {
        Ok(Vec::new())
    }
    fn fetch(&self, _gear_id: &str, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
    fn memory_limit(&self, _gear_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }
    fn restore(&self, _gear_id: &str) -> Result<()> {
        Ok(())
    }
    fn get_cgroup_path(&self, _gear_id: &str) -> PathBuf {
        PathBuf::new()
    }
}

/// Detect available cgroup backend under `root`: v2 preferred, v1 fallback.
pub fn detect_cgroup_backend(root: &Path) -> Option<CgroupBackendType> {
    if root.join("cgroup.controllers").exists() {
        return Some(CgroupBackendType::V2);
    }
    if root.join("memory").exists() && root.join("freezer").exists() {
        return Some(CgroupBackendType::V1);
    }
    None
}

/// Create cgroup backend: v2 default, `force_v1` forces v1, disabled when
/// configured off or nothing is detected.
pub fn create_cgroup_backend(settings: &CgroupSettings) -> Result<Box<dyn CgroupBackend>> {
    if settings.enabled == Some(false) {
        log::info!("Cgroups disabled by configuration");
        return Ok(Box::new(DisabledCgroup));
    }

    let detected = detect_cgroup_backend(&settings.root);
    log::info!(
        "Cgroup backend selection: force_v1={}, detected={:?}",
        settings.force_v1,
        detected
    );

    let backend: Box<dyn CgroupBackend> = match (settings.force_v1, detected) {
        (true, Some(CgroupBackendType::V1)) | (false, Some(CgroupBackendType::V1)) => {
            log::info!("Using cgroup v1 backend");
            Box::new(super::v1::CgroupV1::new(settings))
        }
        (true, Some(CgroupBackendType::V2)) => {
            log::warn!("Cgroup v1 forced but only v2 available, using v2 anyway");
            Box::new(super::v2::CgroupV2::new(settings))
        }
        (false, Some(CgroupBackendType::V2)) => {
            log::info!("Using cgroup v2 backend (default)");
            Box::new(super::v2::CgroupV2::new(settings))
        }
        (_, None) => {
            if settings.enabled == Some(true) {
                return Err(GearError::Cgroup(format!(
                    "Cgroups enabled but no hierarchy found under {}",
                    settings.root.display()
                )));
            }
            log::warn!("No cgroup backend available, continuing without resource limits");
            Box::new(DisabledCgroup)
        }
    };
    Ok(backend)
}

pub fn backend_type_name(backend_type: CgroupBackendType) -> &'static str {
    match backend_type {
        CgroupBackendType::V1 => "cgroup_v1",
        CgroupBackendType::V2 => "cgroup_v2",
    }
}
