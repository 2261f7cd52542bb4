//! OS-specific gear lifecycle capability.
//!
//! Addon management only needs a handful of primitives from the platform
//! flavor hosting a gear; each flavor implements [`ContainerPlugin`] and one
//! is selected at startup.

use super::host::SystemHost;
use super::{Gear, LinuxPlugin};
use crate::config::profile::ResourceProfile;
use crate::config::settings::NodeConfig;
use crate::config::types::Result;
use crate::exec::Exec;
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::selinux::SecurityLabeler;
use crate::safety::cleanup::CleanupReport;
use std::path::Path;
use std::sync::Arc;

pub trait ContainerPlugin: Send + Sync {
    /// The gear this plugin manages
    fn gear(&self) -> &Gear;
    /// Provision the gear, rolling back every partial step on failure
    fn create(&self) -> Result<()>;
    /// Tear the gear down; never fails, the report lists what went wrong
    fn destroy(&self) -> CleanupReport;
    /// Restore runtime state after a host restart
    fn start(&self) -> Result<()>;
    /// Make a path unwritable by the gear
    fn set_file_read_only(&self, path: &Path) -> Result<()>;
    /// Make a path owned and writable by the gear
    fn set_file_read_write(&self, path: &Path) -> Result<()>;
    /// Rewrite a command so it runs as the gear
    fn join(&self, exec: Exec) -> Result<Exec>;
}

/// Node-wide services shared by every plugin instance
pub struct PluginServices {
    pub config: Arc<NodeConfig>,
    pub profile: Arc<ResourceProfile>,
    pub cgroup: Arc<dyn CgroupBackend>,
    pub labeler: Arc<SecurityLabeler>,
}

/// Select the plugin for the running OS
#[cfg(target_os = "linux")]
pub fn select_plugin(services: &PluginServices, gear: Gear) -> Result<Box<dyn ContainerPlugin>> {
    log::debug!("Selected Linux container plugin for {}", gear.id);
    let host = Arc::new(SystemHost::new(&services.config));
    Ok(Box::new(LinuxPlugin::new(
        gear,
        services.config.clone(),
        services.profile.clone(),
        host,
        services.cgroup.clone(),
        services.labeler.clone(),
    )))
}

#[cfg(not(target_os = "linux"))]
pub fn select_plugin(_services: &PluginServices, gear: Gear) -> Result<Box<dyn ContainerPlugin>> {
    Err(crate::config::types::GearError::Config(format!(
        "No container plugin for this OS (gear {})",
        gear.id
    )))
}
