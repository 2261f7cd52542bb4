//! Cgroup v1 resource governance.
//!
//! One directory per controller: `<root>/<controller>/<slice>/<gear>`. The
//! controller of a parameter is the prefix of its key (`memory.limit_in_bytes`
//! lives under `memory`).

use super::backend::{
    parse_memory_limit, read_param, read_pids, remove_group_dir, write_param, CgroupBackend,
    CgroupState, StateStore,
};
use crate::config::settings::CgroupSettings;
use crate::config::types::{GearError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

/// Controllers every gear group is placed in regardless of parameters
const BASE_CONTROLLERS: &[&str] = &["freezer", "memory", "cpu"];

pub struct CgroupV1 {
    root: PathBuf,
    slice: String,
    state: StateStore,
}

fn controller_of(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

impl CgroupV1 {
    pub fn new(settings: &CgroupSettings) -> Self {
        Self {
            root: settings.root.clone(),
            slice: settings.slice.clone(),
            state: StateStore::new(&settings.state_dir),
        }
    }

    fn group_dir(&self, controller: &str, gear_id: &str) -> PathBuf {
        self.root.join(controller).join(&self.slice).join(gear_id)
    }

    fn make_groups(&self, gear_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let mut controllers: BTreeSet<&str> = BASE_CONTROLLERS.iter().copied().collect();
        controllers.extend(params.keys().map(|k| controller_of(k)));

        for controller in controllers {
            if !self.root.join(controller).is_dir() {
                if params.keys().any(|k| controller_of(k) == controller) {
                    return Err(GearError::Cgroup(format!(
                        "Controller '{}' is not mounted under {}",
                        controller,
                        self.root.display()
                    )));
                }
                log::debug!("Skipping unmounted controller {}", controller);
                continue;
            }
            let dir = self.group_dir(controller, gear_id);
            fs::create_dir_all(&dir).map_err(|e| {
                GearError::Cgroup(format!("Failed to create cgroup {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    fn apply(&self, gear_id: &str, state: &CgroupState) -> Result<()> {
        self.make_groups(gear_id, &state.params)?;
        for (key, value) in &state.params {
            write_param(&self.group_dir(controller_of(key), gear_id), key, value)?;
        }
        if state.frozen {
            self.write_freezer(gear_id, "FROZEN")?;
        }
        Ok(())
    }

    fn write_freezer(&self, gear_id: &str, value: &str) -> Result<()> {
        write_param(&self.group_dir("freezer", gear_id), "freezer.state", value)
    }
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &str {
        "cgroup_v1"
    }

    fn create(&self, gear_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let state = CgroupState {
            params: params.clone(),
            frozen: false,
        };
        self.apply(gear_id, &state)?;
        self.state.save(gear_id, &state)?;
        log::info!("Created cgroup v1 groups for {}", gear_id);
        Ok(())
    }

    fn delete(&self, gear_id: &str) -> Result<()> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            GearError::Cgroup(format!("Failed to list {}: {}", self.root.display(), e))
        })?;

        let mut first_error = None;
        for entry in entries.flatten() {
            let controller = entry.file_name().to_string_lossy().into_owned();
            if let Err(e) = remove_group_dir(&self.group_dir(&controller, gear_id)) {
                log::warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        self.state.remove(gear_id)?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn freeze(&self, gear_id: &str) -> Result<()> {
        self.write_freezer(gear_id, "FROZEN")?;
        self.state.set_frozen(gear_id, true)
    }

    fn thaw(&self, gear_id: &str) -> Result<()> {
        self.write_freezer(gear_id, "THAWED")?;
        self.state.set_frozen(gear_id, false)
    }

    fn tasks(&self, gear_id: &str) -> Result<Vec<i32>> {
        read_pids(&self.group_dir("freezer", gear_id), "tasks")
    }

    fn fetch(&self, gear_id: &str, key: &str) -> Result<Option<String>> {
        read_param(&self.group_dir(controller_of(key), gear_id), key)
    }

    fn memory_limit(&self, gear_id: &str) -> Result<Option<u64>> {
        match self.fetch(gear_id, "memory.limit_in_bytes")? {
            Some(value) => parse_memory_limit(&value),
            None => Ok(None),
        }
    }

    fn restore(&self, gear_id: &str) -> Result<()> {
        match self.state.load(gear_id)? {
            Some(state) => {
                self.apply(gear_id, &state)?;
                log::info!("Restored cgroup v1 groups for {} (frozen={})", gear_id, state.frozen);
                Ok(())
            }
            None => {
                log::debug!("No persisted cgroup state for {}", gear_id);
                Ok(())
            }
        }
    }

    fn get_cgroup_path(&self, gear_id: &str) -> PathBuf {
        self.group_dir("freezer", gear_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn setup(root: &Path) -> CgroupV1 {
        for controller in ["freezer", "memory", "cpu"] {
            fs::create_dir(root.join(controller)).unwrap();
        }
        CgroupV1::new(&CgroupSettings {
            enabled: Some(true),
            force_v1: true,
            root: root.to_path_buf(),
            slice: "gearbox".to_string(),
            state_dir: root.join("state"),
        })
    }

    fn params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("memory.limit_in_bytes".to_string(), "536870912".to_string());
        params.insert("cpu.shares".to_string(), "128".to_string());
        params
    }

    #[test]
    fn test_create_writes_parameters_per_controller() {
        let root = tempfile::tempdir().unwrap();
        let cg = setup(root.path());
        cg.create("g1", &params()).unwrap();

        let mem = root.path().join("memory/gearbox/g1/memory.limit_in_bytes");
        assert_eq!(fs::read_to_string(mem).unwrap(), "536870912");
        assert_eq!(cg.fetch("g1", "cpu.shares").unwrap().as_deref(), Some("128"));
        assert_eq!(cg.memory_limit("g1").unwrap(), Some(536870912));
        assert!(root.path().join("freezer/gearbox/g1").is_dir());
    }

    #[test]
    fn test_unmounted_controller_for_parameter_fails() {
        let root = tempfile::tempdir().unwrap();
        let cg = setup(root.path());
        let mut p = params();
        p.insert("pids.max".to_string(), "100".to_string());
        assert!(matches!(cg.create("g1", &p), Err(GearError::Cgroup(_))));
    }

    #[test]
    fn test_freeze_thaw_and_tasks() {
        let root = tempfile::tempdir().unwrap();
        let cg = setup(root.path());
        cg.create("g1", &params()).unwrap();

        cg.freeze("g1").unwrap();
        let state = root.path().join("freezer/gearbox/g1/freezer.state");
        assert_eq!(fs::read_to_string(&state).unwrap(), "FROZEN");
        cg.thaw("g1").unwrap();
        assert_eq!(fs::read_to_string(&state).unwrap(), "THAWED");

        assert!(cg.tasks("g1").unwrap().is_empty());
        fs::write(root.path().join("freezer/gearbox/g1/tasks"), "12\n34\n").unwrap();
        assert_eq!(cg.tasks("g1").unwrap(), vec![12, 34]);
    }

    #[test]
    fn test_restore_reapplies_frozen_state() {
        let root = tempfile::tempdir().unwrap();
        let cg = setup(root.path());
        cg.create("g1", &params()).unwrap();
        cg.freeze("g1").unwrap();

        // Simulate a reboot wiping the hierarchy
        for controller in ["freezer", "memory", "cpu"] {
            fs::remove_dir_all(root.path().join(controller)).unwrap();
            fs::create_dir(root.path().join(controller)).unwrap();
        }

        cg.restore("g1").unwrap();
        assert_eq!(cg.memory_limit("g1").unwrap(), Some(536870912));
        assert_eq!(
            fs::read_to_string(root.path().join("freezer/gearbox/g1/freezer.state")).unwrap(),
            "FROZEN"
        );
    }

    #[test]
    fn test_delete_missing_group_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let cg = setup(root.path());
        cg.delete("never-created").unwrap();
        cg.restore("never-created").unwrap();
    }
}
