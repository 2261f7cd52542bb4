use crate::config::types::{GearError, Result};
/// Node configuration loading from node.json
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default location of the node configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gearbox/node.json";
/// SELinux MCS has at most 1024 categories (c0..c1023)
pub const MAX_MCS_SET_SIZE: u32 = 1024;

/// Full node.json structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Parent directory of every gear home
    pub gear_base_dir: PathBuf,
    /// Persistent agent state (gear records, cgroup snapshots)
    pub var_dir: PathBuf,
    /// Runtime state (per-gear advisory locks)
    pub run_dir: PathBuf,
    /// Directory holding installable addons referenced by bare name
    pub plugins_dir: PathBuf,
    /// Directory receiving per-gear PAM limits files
    pub pam_limits_dir: PathBuf,
    /// Directory holding the proxy key/value databases
    pub proxy_dir: PathBuf,
    /// Capacity tier definitions
    pub profile_path: PathBuf,
    /// Login shell of gear accounts
    pub gear_shell: String,
    pub cgroup: CgroupSettings,
    pub selinux: SelinuxSettings,
    pub traffic: TrafficSettings,
    /// Global configuration exposed to addon templates as `config.*`
    pub template: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupSettings {
    /// `None` selects by detection
    pub enabled: Option<bool>,
    pub force_v1: bool,
    pub root: PathBuf,
    /// Sub-hierarchy under the root that holds gear groups
    pub slice: String,
    /// Where applied parameters are persisted for restore after reboot
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelinuxSettings {
    /// `None` selects by detection
    pub enabled: Option<bool>,
    pub mcs_set_size: u32,
    pub mcs_group_size: u32,
    pub mcs_uid_offset: u32,
    pub mls_num: u32,
    pub run_user: String,
    pub run_role: String,
    pub run_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficSettings {
    pub enabled: bool,
    pub device: String,
    pub rate: String,
    pub ceil: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gear_base_dir: PathBuf::from("/var/lib/gearbox/gears"),
            var_dir: PathBuf::from("/var/lib/gearbox"),
            run_dir: PathBuf::from("/run/gearbox"),
            plugins_dir: PathBuf::from("/var/lib/gearbox/.plugins"),
            pam_limits_dir: PathBuf::from("/etc/security/limits.d"),
            proxy_dir: PathBuf::from("/var/lib/gearbox/proxy"),
            profile_path: PathBuf::from("/etc/gearbox/limits.json"),
            gear_shell: "/bin/bash".to_string(),
            cgroup: CgroupSettings::default(),
            selinux: SelinuxSettings::default(),
            traffic: TrafficSettings::default(),
            template: BTreeMap::new(),
        }
    }
}

impl Default for CgroupSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            force_v1: false,
            root: PathBuf::from("/sys/fs/cgroup"),
            slice: "gearbox".to_string(),
            state_dir: PathBuf::from("/var/lib/gearbox/cgroup"),
        }
    }
}

impl Default for SelinuxSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            mcs_set_size: 1024,
            mcs_group_size: 2,
            mcs_uid_offset: 0,
            mls_num: 0,
            run_user: "unconfined_u".to_string(),
            run_role: "system_r".to_string(),
            run_type: "gear_t".to_string(),
        }
    }
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "eth0".to_string(),
            rate: "100mbit".to_string(),
            ceil: "100mbit".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GearError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: NodeConfig = serde_json::from_str(&content).map_err(|e| {
            GearError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load the explicit path if given, else the default file if present, else built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load_from_file(default_path)
        } else {
            log::debug!("{} not found, using built-in defaults", DEFAULT_CONFIG_PATH);
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        let mcs = &self.selinux;
        if mcs.mcs_set_size > MAX_MCS_SET_SIZE {
            return Err(GearError::Config(format!(
                "MCS set size {} exceeds {}",
                mcs.mcs_set_size, MAX_MCS_SET_SIZE
            )));
        }
        if mcs.mcs_group_size == 0 || mcs.mcs_group_size > mcs.mcs_set_size {
            return Err(GearError::Config(format!(
                "MCS group size {} must be between 1 and the set size {}",
                mcs.mcs_group_size, mcs.mcs_set_size
            )));
        }
        if self.gear_shell.is_empty() {
            return Err(GearError::Config("gear_shell must not be empty".to_string()));
        }
        Ok(())
    }

    /// Home directory of the named gear
    pub fn gear_home(&self, gear_id: &str) -> PathBuf {
        self.gear_base_dir.join(gear_id)
    }

    /// Directory of persisted gear records
    pub fn gear_records_dir(&self) -> PathBuf {
        self.var_dir.join("gears")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"gear_base_dir": "/srv/gears", "selinux": {"mls_num": 3}}"#)
                .unwrap();
        assert_eq!(config.gear_base_dir, PathBuf::from("/srv/gears"));
        assert_eq!(config.selinux.mls_num, 3);
        assert_eq!(config.selinux.mcs_set_size, 1024);
        assert_eq!(config.pam_limits_dir, PathBuf::from("/etc/security/limits.d"));
        assert_eq!(config.gear_home("g1"), PathBuf::from("/srv/gears/g1"));
    }

    #[test]
    fn test_load_rejects_bad_group_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"selinux": {"mcs_set_size": 4, "mcs_group_size": 5}}"#).unwrap();
        assert!(matches!(NodeConfig::load_from_file(&path), Err(GearError::Config(_))));
    }

    #[test]
    fn test_load_rejects_oversized_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"selinux": {"mcs_set_size": 4294967295}}"#).unwrap();
        match NodeConfig::load_from_file(&path) {
            Err(GearError::Config(msg)) => assert!(msg.contains("4294967295"), "{}", msg),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let result = NodeConfig::load(Some(Path::new("/nonexistent/gearbox/node.json")));
        assert!(matches!(result, Err(GearError::Config(_))));
    }
}
