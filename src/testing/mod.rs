//! Test doubles
//!
//! In-memory stand-ins for the collaborators of the addon lifecycle, so it
//! can be driven against a scratch gear home without root, a proxy or git.

use crate::addon::endpoint::AddressProbe;
use crate::addon::repository::{Repository, RepositoryFactory};
use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use crate::gear::{ContainerPlugin, Gear};
use crate::proxy::{is_supported, is_valid_frontend, mapping_key, ProxyRegistry};
use crate::safety::cleanup::CleanupReport;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plugin that records ownership changes and runs commands as the caller
pub struct RecordingPlugin {
    gear: Gear,
    ownership: Mutex<Vec<(bool, PathBuf)>>,
}

impl RecordingPlugin {
    pub fn new(gear: Gear) -> Self {
        Self {
            gear,
            ownership: Mutex::new(Vec::new()),
        }
    }

    pub fn read_only_paths(&self) -> Vec<PathBuf> {
        self.paths(true)
    }

    pub fn read_write_paths(&self) -> Vec<PathBuf> {
        self.paths(false)
    }

    fn paths(&self, read_only: bool) -> Vec<PathBuf> {
        locked(&self.ownership)
            .iter()
            .filter(|(ro, _)| *ro == read_only)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl ContainerPlugin for RecordingPlugin {
    fn gear(&self) -> &Gear {
        &self.gear
    }

    fn create(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> CleanupReport {
        CleanupReport::default()
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn set_file_read_only(&self, path: &Path) -> Result<()> {
        locked(&self.ownership).push((true, path.to_path_buf()));
        Ok(())
    }

    fn set_file_read_write(&self, path: &Path) -> Result<()> {
        locked(&self.ownership).push((false, path.to_path_buf()));
        Ok(())
    }

    fn join(&self, exec: Exec) -> Result<Exec> {
        Ok(exec)
    }
}

/// Nothing is ever listening
pub struct FreeProbe;

impl AddressProbe for FreeProbe {
    fn is_bound(&self, _ip: Ipv4Addr, _port: u16) -> bool {
        false
    }
}

/// The listed ports are taken on every address
pub struct BusyProbe(pub Vec<u16>);

impl AddressProbe for BusyProbe {
    fn is_bound(&self, _ip: Ipv4Addr, port: u16) -> bool {
        self.0.contains(&port)
    }
}

/// Proxy registry held in memory, optionally failing every call
#[derive(Default)]
pub struct MemoryProxy {
    mappings: Mutex<BTreeMap<String, String>>,
    purged: Mutex<Vec<String>>,
    failing: bool,
}

impl MemoryProxy {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn mappings(&self) -> BTreeMap<String, String> {
        locked(&self.mappings).clone()
    }

    /// Gear ids passed to `purge`, in call order
    pub fn purged(&self) -> Vec<String> {
        locked(&self.purged).clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(GearError::Proxy("proxy unavailable".to_string()));
        }
        Ok(())
    }
}

impl ProxyRegistry for MemoryProxy {
    fn add_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        let mut table = locked(&self.mappings);
        for (frontend, backend) in mappings
            .iter()
            .filter(|(f, b)| is_valid_frontend(f) && is_supported(b))
        {
            table
                .entry(mapping_key(&gear.id, frontend))
                .or_insert_with(|| backend.clone());
        }
        Ok(())
    }

    fn remove_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()> {
        self.check()?;
        let mut table = locked(&self.mappings);
        for frontend in mappings.keys().filter(|f| is_valid_frontend(f)) {
            table.remove(&mapping_key(&gear.id, frontend));
        }
        Ok(())
    }

    fn purge(&self, gear: &Gear) -> Result<()> {
        locked(&self.purged).push(gear.id.clone());
        self.check()?;
        locked(&self.mappings).retain(|key, _| !key.starts_with(&format!("{}/", gear.id)));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    calls: Vec<&'static str>,
    exists: bool,
    fail_on: Option<&'static str>,
}

/// Repository factory recording every operation by name
#[derive(Debug, Default, Clone)]
pub struct RecordingRepositories {
    state: Arc<Mutex<RepositoryState>>,
}

impl RecordingRepositories {
    /// Make the named operation fail
    pub fn failing_on(operation: &'static str) -> Self {
        let repos = Self::default();
        locked(&repos.state).fail_on = Some(operation);
        repos
    }

    pub fn calls(&self) -> Vec<&'static str> {
        locked(&self.state).calls.clone()
    }

    pub fn exists(&self) -> bool {
        locked(&self.state).exists
    }
}

struct RecordingRepository {
    state: Arc<Mutex<RepositoryState>>,
}

impl RecordingRepository {
    fn record(&self, operation: &'static str, creates: Option<bool>) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(operation);
        if state.fail_on == Some(operation) {
            return Err(GearError::ExternalTool {
                command: format!("git {}", operation),
                status: Some(128),
                stderr: "simulated failure".to_string(),
            });
        }
        if let Some(exists) = creates {
            state.exists = exists;
        }
        Ok(())
    }
}

impl Repository for RecordingRepository {
    fn exists(&self) -> bool {
        locked(&self.state).exists
    }

    fn populate_from_template(&self, _addon_dir: &Path) -> Result<()> {
        self.record("populate_from_template", Some(true))
    }

    fn populate_from_url(&self, _url: &str) -> Result<()> {
        self.record("populate_from_url", Some(true))
    }

    fn populate_empty(&self) -> Result<()> {
        self.record("populate_empty", Some(true))
    }

    fn checkout(&self, _target: &Path) -> Result<()> {
        self.record("checkout", None)
    }

    fn tidy(&self) -> Result<()> {
        self.record("tidy", None)
    }

    fn destroy(&self) -> Result<()> {
        self.record("destroy", Some(false))
    }
}

impl RepositoryFactory for RecordingRepositories {
    fn open<'a>(&self, _plugin: &'a dyn ContainerPlugin) -> Box<dyn Repository + 'a> {
        Box::new(RecordingRepository {
            state: self.state.clone(),
        })
    }
}
