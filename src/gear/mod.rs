//! Gears: isolated OS-level units hosting one application instance.
//!
//! A [`Gear`] is the in-memory view of one gear; [`GearRecord`] is what is
//! persisted under `<var_dir>/gears/<id>.json` so later commands can find
//! the uid, capacity and domain chosen at creation.

pub mod environ;
pub mod host;
pub mod linux;
pub mod plugin;

use crate::config::settings::NodeConfig;
use crate::config::types::{GearError, Result};
use crate::kernel::account::{APP_DIR, ENV_DIR, TMP_DIR};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub use host::{HostOps, SystemHost};
pub use linux::LinuxPlugin;
pub use plugin::{select_plugin, ContainerPlugin};

/// Gear ids double as account names
static GEAR_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").expect("valid gear id regex"));

/// Highest host id usable inside a gear's private address block
pub const MAX_HOST_ID: u8 = 127;

/// Uids must fit the 17 bits left in 127.0.0.0/8 above the 7-bit host id
const MAX_IP_UID: u32 = 1 << 17;

pub fn validate_gear_id(id: &str) -> Result<()> {
    if GEAR_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(GearError::Config(format!("Invalid gear id '{}'", id)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gear {
    pub id: String,
    pub uid: u32,
    pub capacity: String,
    pub domain: String,
    pub home: PathBuf,
}

impl Gear {
    pub fn new(
        id: impl Into<String>,
        uid: u32,
        capacity: impl Into<String>,
        domain: impl Into<String>,
        home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            uid,
            capacity: capacity.into(),
            domain: domain.into(),
            home: home.into(),
        }
    }

    /// Gears get a private group with the same number as their uid
    pub fn gid(&self) -> u32 {
        self.uid
    }

    /// Platform-owned environment variables
    pub fn env_dir(&self) -> PathBuf {
        self.home.join(ENV_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home.join(TMP_DIR)
    }

    pub fn app_dir(&self) -> PathBuf {
        self.home.join(APP_DIR)
    }

    /// Variables set by the application owner
    pub fn user_env_dir(&self) -> PathBuf {
        self.app_dir().join(".gear").join("env")
    }

    /// Repository hooks run around start/stop
    pub fn hooks_dir(&self) -> PathBuf {
        self.app_dir().join(".gear").join("hooks")
    }

    pub fn addon_dir(&self, name: &str) -> PathBuf {
        self.home.join(name)
    }

    /// Private loopback address `host_id` of this gear.
    ///
    /// Each gear owns a /25 of 127.0.0.0/8 selected by its uid.
    pub fn ip_address(&self, host_id: u8) -> Result<Ipv4Addr> {
        if host_id == 0 || host_id > MAX_HOST_ID {
            return Err(GearError::OutOfRange(format!(
                "Host id {} outside 1..={}",
                host_id, MAX_HOST_ID
            )));
        }
        if self.uid >= MAX_IP_UID {
            return Err(GearError::Config(format!(
                "UID {} is too large to derive a private address",
                self.uid
            )));
        }
        Ok(Ipv4Addr::from(0x7F00_0000 | (self.uid << 7) | host_id as u32))
    }
}

/// Persisted identity of a gear
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GearRecord {
    pub id: String,
    pub uid: u32,
    pub capacity: String,
    pub domain: String,
}

impl GearRecord {
    fn path(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.json", id))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| GearError::fs(dir, e))?;
        let path = Self::path(dir, &self.id);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .map_err(|e| GearError::fs(&path, e))
    }

    pub fn load(dir: &Path, id: &str) -> Result<Self> {
        validate_gear_id(id)?;
        let path = Self::path(dir, id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GearError::NotFound(format!("Gear {}", id)));
            }
            Err(e) => return Err(GearError::fs(&path, e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    pub fn remove(dir: &Path, id: &str) -> Result<()> {
        let path = Self::path(dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GearError::fs(&path, e)),
        }
    }

    pub fn to_gear(&self, config: &NodeConfig) -> Gear {
        Gear::new(
            self.id.clone(),
            self.uid,
            self.capacity.clone(),
            self.domain.clone(),
            config.gear_home(&self.id),
        )
    }
}

impl From<&Gear> for GearRecord {
    fn from(gear: &Gear) -> Self {
        Self {
            id: gear.id.clone(),
            uid: gear.uid,
            capacity: gear.capacity.clone(),
            domain: gear.domain.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_address_layout() {
        let gear = Gear::new("g1", 1001, "small", "g1.example.com", "/tmp/g1");
        // 1001 << 7 = 0x1F480
        assert_eq!(gear.ip_address(1).unwrap(), Ipv4Addr::new(127, 1, 244, 129));
        assert_eq!(gear.ip_address(127).unwrap(), Ipv4Addr::new(127, 1, 244, 255));
        assert!(matches!(gear.ip_address(0), Err(GearError::OutOfRange(_))));
        assert!(matches!(gear.ip_address(128), Err(GearError::OutOfRange(_))));
    }

    #[test]
    fn test_ip_address_rejects_large_uid() {
        let gear = Gear::new("g1", 1 << 17, "small", "d", "/tmp/g1");
        assert!(matches!(gear.ip_address(1), Err(GearError::Config(_))));
    }

    #[test]
    fn test_gear_id_validation() {
        assert!(validate_gear_id("app-1_x").is_ok());
        assert!(validate_gear_id("").is_err());
        assert!(validate_gear_id("../etc").is_err());
        assert!(validate_gear_id("Upper").is_err());
    }

    #[test]
    fn test_record_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let gear = Gear::new("g1", 1001, "small", "g1.example.com", "/srv/g1");
        GearRecord::from(&gear).save(dir.path()).unwrap();

        let record = GearRecord::load(dir.path(), "g1").unwrap();
        let config = NodeConfig {
            gear_base_dir: PathBuf::from("/srv"),
            ..NodeConfig::default()
        };
        assert_eq!(record.to_gear(&config), gear);

        GearRecord::remove(dir.path(), "g1").unwrap();
        assert!(matches!(GearRecord::load(dir.path(), "g1"), Err(GearError::NotFound(_))));
    }
}
