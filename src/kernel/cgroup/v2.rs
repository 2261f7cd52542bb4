/// Cgroup v2 backend implementation
/// Unified hierarchy: `<root>/<slice>/<gear>`, freezer via `cgroup.freeze`,
/// members via `cgroup.procs`. Parameters arrive with v1 key names and are
/// translated to their v2 counterparts before being written.

use crate::kernel::cgroup::backend::{
    parse_memory_limit, read_param, read_pids, remove_group_dir, write_param, CgroupBackend,
    CgroupState, StateStore,
};
use crate::config::settings::CgroupSettings;
use crate::config::types::{GearError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Controllers delegated to the slice so gear groups can use them
const DELEGATED_CONTROLLERS: &str = "+memory +cpu +pids";

/// Cgroup v2 backend
pub struct CgroupV2 {
    root: PathBuf,
    slice: String,
    state: StateStore,
}

/// Map `cpu.shares` (2..=262144, default 1024) onto `cpu.weight` (1..=10000)
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262144);
    1 + ((shares - 2) * 9999) / 262142
}

/// v2 name of a v1 parameter key
fn translate_key(key: &str) -> &str {
    match key {
        "memory.limit_in_bytes" => "memory.max",
        "memory.memsw.limit_in_bytes" => "memory.swap.max",
        "memory.soft_limit_in_bytes" => "memory.low",
        "cpu.shares" => "cpu.weight",
        other => other,
    }
}

/// Translate a v1 parameter set into v2 files and values.
///
/// v1 limits memory+swap together while v2 limits swap alone, so the swap
/// value is the difference when both limits are given.
pub fn translate_params(params: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in params {
        let translated = match key.as_str() {
            "cpu.shares" => {
                let shares: u64 = value.trim().parse().map_err(|_| {
                    GearError::Cgroup(format!("Invalid cpu.shares value '{}'", value))
                })?;
                shares_to_weight(shares).to_string()
            }
            "memory.memsw.limit_in_bytes" => {
                let memsw = value.trim().parse::<u64>().ok();
                let mem = params
                    .get("memory.limit_in_bytes")
                    .and_then(|m| m.trim().parse::<u64>().ok());
                match (memsw, mem) {
                    (Some(memsw), Some(mem)) => memsw.saturating_sub(mem).to_string(),
                    _ => value.clone(),
                }
            }
            _ => value.clone(),
        };
        out.insert(translate_key(key).to_string(), translated);
    }
    Ok(out)
}

impl CgroupV2 {
    pub fn new(settings: &CgroupSettings) -> Self {
        Self {
            root: settings.root.clone(),
            slice: settings.slice.clone(),
            state: StateStore::new(&settings.state_dir),
        }
    }

    /// Get cgroup path for a gear
    fn instance_path(&self, gear_id: &str) -> PathBuf {
        self.root.join(&self.slice).join(gear_id)
    }

    fn apply(&self, gear_id: &str, state: &CgroupState) -> Result<()> {
        let slice = self.root.join(&self.slice);
        let path = self.instance_path(gear_id);
        fs::create_dir_all(&path).map_err(|e| {
            GearError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        // Controllers may already be delegated, or not delegable on this host
        if let Err(e) = write_param(&slice, "cgroup.subtree_control", DELEGATED_CONTROLLERS) {
            log::warn!("Failed to delegate controllers to {}: {}", slice.display(), e);
        }

        for (key, value) in translate_params(&state.params)? {
            write_param(&path, &key, &value)?;
        }
        if state.frozen {
            write_param(&path, "cgroup.freeze", "1")?;
        }
        Ok(())
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, gear_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let state = CgroupState {
            params: params.clone(),
            frozen: false,
        };
        self.apply(gear_id, &state)?;
        self.state.save(gear_id, &state)?;
        log::info!("Created cgroup v2 group {}", self.instance_path(gear_id).display());
        Ok(())
    }

    fn delete(&self, gear_id: &str) -> Result<()> {
        remove_group_dir(&self.instance_path(gear_id))?;
        self.state.remove(gear_id)
    }

    fn freeze(&self, gear_id: &str) -> Result<()> {
        write_param(&self.instance_path(gear_id), "cgroup.freeze", "1")?;
        self.state.set_frozen(gear_id, true)
    }

    fn thaw(&self, gear_id: &str) -> Result<()> {
        write_param(&self.instance_path(gear_id), "cgroup.freeze", "0")?;
        self.state.set_frozen(gear_id, false)
    }

    fn tasks(&self, gear_id: &str) -> Result<Vec<i32>> {
        read_pids(&self.instance_path(gear_id), "cgroup.procs")
    }

    fn fetch(&self, gear_id: &str, key: &str) -> Result<Option<String>> {
        read_param(&self.instance_path(gear_id), translate_key(key))
    }

    fn memory_limit(&self, gear_id: &str) -> Result<Option<u64>> {
        match read_param(&self.instance_path(gear_id), "memory.max")? {
            Some(value) => parse_memory_limit(&value),
            None => Ok(None),
        }
    }

    fn restore(&self, gear_id: &str) -> Result<()> {
        match self.state.load(gear_id)? {
            Some(state) => {
                self.apply(gear_id, &state)?;
                log::info!("Restored cgroup v2 group for {} (frozen={})", gear_id, state.frozen);
                Ok(())
            }
            None => {
                log::debug!("No persisted cgroup state for {}", gear_id);
                Ok(())
            }
        }
    }

    fn get_cgroup_path(&self, gear_id: &str) -> PathBuf {
        self.instance_path(gear_id)
    }
}
