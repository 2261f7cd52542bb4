//! Linux gear lifecycle: accounts, cgroups, quota, PAM limits, traffic
//! shaping and SELinux labels.

use super::environ;
use super::host::HostOps;
use super::plugin::ContainerPlugin;
use super::Gear;
use crate::config::profile::{CapacityTier, ResourceProfile};
use crate::config::settings::NodeConfig;
use crate::config::types::{GearError, Result};
use crate::exec::{shell_join, Exec};
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::pam;
use crate::kernel::selinux::SecurityLabeler;
use crate::safety::cleanup::{CleanupManager, CleanupReport};
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound of freeze/kill rounds before giving up
pub const MAX_FREEZE_ATTEMPTS: usize = 20;
/// Delay letting thawed processes handle their pending SIGKILL
pub const FREEZE_RETRY_DELAY: Duration = Duration::from_millis(100);

const RUNUSER: &str = "/sbin/runuser";
const RUNCON: &str = "/usr/bin/runcon";

/// Result of the freeze/kill loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Convergence {
    pub converged: bool,
    /// Kill/thaw/pause/freeze rounds performed
    pub cycles: usize,
}

/// Freeze the group and kill its members until it is empty.
///
/// Frozen processes cannot fork, so each round shrinks the group; thawing
/// lets the pending SIGKILLs be delivered. Errors inside a round are logged
/// and the next round is attempted.
pub fn freeze_and_kill(cgroup: &dyn CgroupBackend, host: &dyn HostOps, gear_id: &str) -> Convergence {
    if let Err(e) = cgroup.freeze(gear_id) {
        warn!("Failed to freeze {}: {}", gear_id, e);
    }

    let mut cycles = 0;
    for attempt in 0..MAX_FREEZE_ATTEMPTS {
        let round = || -> Result<bool> {
            let pids = cgroup.tasks(gear_id)?;
            if pids.is_empty() {
                return Ok(true);
            }
            debug!("Freeze round {} for {}: killing {:?}", attempt, gear_id, pids);
            for pid in pids {
                if let Err(e) = host.kill_pid(pid) {
                    warn!("Failed to kill {} in {}: {}", pid, gear_id, e);
                }
            }
            Ok(false)
        };

        match round() {
            Ok(true) => return Convergence { converged: true, cycles },
            Ok(false) => {}
            Err(e) => warn!("Freeze round {} for {} failed: {}", attempt, gear_id, e),
        }

        cycles += 1;
        if let Err(e) = cgroup.thaw(gear_id) {
            warn!("Failed to thaw {}: {}", gear_id, e);
        }
        host.pause(FREEZE_RETRY_DELAY);
        if let Err(e) = cgroup.freeze(gear_id) {
            warn!("Failed to refreeze {}: {}", gear_id, e);
        }
    }

    Convergence {
        converged: false,
        cycles,
    }
}

/// Command line running `argv` as the gear, under `target_context` when the
/// caller's SELinux context differs from it
pub fn join_command(
    argv: &[String],
    gear_id: &str,
    target_context: Option<&str>,
    current_context: Option<&str>,
) -> Vec<String> {
    let mut cmd = shell_join(argv);
    if let Some(target) = target_context {
        if current_context != Some(target) {
            cmd = format!(
                "exec {} {} /bin/sh -c {}",
                RUNCON,
                shell_escape::escape(Cow::Borrowed(target)),
                shell_escape::escape(Cow::Owned(cmd))
            );
        }
    }
    vec![
        RUNUSER.to_string(),
        "-s".to_string(),
        "/bin/sh".to_string(),
        gear_id.to_string(),
        "-c".to_string(),
        cmd,
    ]
}

pub struct LinuxPlugin {
    gear: Gear,
    config: Arc<NodeConfig>,
    profile: Arc<ResourceProfile>,
    host: Arc<dyn HostOps>,
    cgroup: Arc<dyn CgroupBackend>,
    labeler: Arc<SecurityLabeler>,
}

impl LinuxPlugin {
    pub fn new(
        gear: Gear,
        config: Arc<NodeConfig>,
        profile: Arc<ResourceProfile>,
        host: Arc<dyn HostOps>,
        cgroup: Arc<dyn CgroupBackend>,
        labeler: Arc<SecurityLabeler>,
    ) -> Self {
        Self {
            gear,
            config,
            profile,
            host,
            cgroup,
            labeler,
        }
    }

    fn pam_dir(&self) -> &Path {
        &self.config.pam_limits_dir
    }

    /// Publish the cgroup memory limit as `MEMORY_LIMIT` (MiB); best effort
    fn refresh_memory_limit(&self) {
        let limit = match self.cgroup.memory_limit(&self.gear.id) {
            Ok(Some(bytes)) => bytes / (1024 * 1024),
            Ok(None) => return,
            Err(e) => {
                debug!("No memory limit for {}: {}", self.gear.id, e);
                return;
            }
        };
        if let Err(e) = environ::add(&self.gear.env_dir(), "MEMORY_LIMIT", &limit.to_string(), false) {
            debug!("Failed to record MEMORY_LIMIT for {}: {}", self.gear.id, e);
        }
    }

    /// Apply the tier's quota; current overage is reported but not enforced
    fn init_quota(&self, tier: &CapacityTier) -> Result<()> {
        let blocks = tier.quota.blocks;
        let files = tier.quota.files;

        if let Some(current) = self.host.current_quota(&self.gear)? {
            if current.exceeds(blocks, files) {
                warn!(
                    "Gear {} already uses {} blocks / {} files, above the new quota {} / {}",
                    self.gear.id, current.used_blocks, current.used_files, blocks, files
                );
            }
        }
        self.host.set_quota(&self.gear, blocks, files)
    }

    fn create_steps(&self, tier: &CapacityTier) -> Result<()> {
        self.host.create_user(&self.gear)?;
        self.host.create_home(&self.gear)?;
        self.cgroup.create(&self.gear.id, &tier.cgroup)?;
        self.refresh_memory_limit();
        self.host.start_traffic_control(self.gear.uid)?;
        self.init_quota(tier)?;
        pam::write_pam_limits(self.pam_dir(), self.profile.limits_order, &self.gear.id, &tier.limits)?;
        Ok(())
    }

    fn apply_label(&self, path: &Path) -> Result<()> {
        if let Some(label) = self.labeler.label_for(self.gear.uid)? {
            self.labeler.apply(path, &label)?;
        }
        Ok(())
    }

    fn set_owner(&self, path: &Path, uid: u32) -> Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(self.gear.gid()))
            .map_err(|e| GearError::fs(path, e))?;
        self.apply_label(path)
    }
}

impl ContainerPlugin for LinuxPlugin {
    fn gear(&self) -> &Gear {
        &self.gear
    }

    fn create(&self) -> Result<()> {
        let tier = self.profile.tier(&self.gear.capacity)?;
        info!("Creating gear {} (uid={}, capacity={})", self.gear.id, self.gear.uid, self.gear.capacity);

        if let Err(e) = self.create_steps(tier) {
            error!("Failed to create gear {}: {}", self.gear.id, e);
            let uid = self.gear.uid;
            let order = self.profile.limits_order;
            CleanupManager::new(format!("create rollback {}", self.gear.id))
                .step("delete_user", || self.host.delete_user(&self.gear))
                .step("cg_delete", || self.cgroup.delete(&self.gear.id))
                .step("stop_traffic_control", || self.host.stop_traffic_control(uid))
                .step("remove_pam_limits", || {
                    pam::remove_pam_limits(self.pam_dir(), order, &self.gear.id)
                })
                .run();
            return Err(e);
        }

        info!("Created gear {}", self.gear.id);
        Ok(())
    }

    fn destroy(&self) -> CleanupReport {
        let uid = self.gear.uid;
        let id = self.gear.id.as_str();
        let order = self.profile.limits_order;

        info!("Destroying gear {}", id);
        CleanupManager::new(format!("destroy {}", id))
            .step("kill_procs", || self.host.kill_user_processes(uid))
            .step("cg_freeze", || {
                let outcome = freeze_and_kill(self.cgroup.as_ref(), self.host.as_ref(), id);
                if outcome.converged {
                    Ok(())
                } else {
                    Err(GearError::Cgroup(format!(
                        "Processes of {} still running after {} rounds",
                        id, outcome.cycles
                    )))
                }
            })
            .step("kill_procs_again", || self.host.kill_user_processes(uid))
            .step("delete_user", || self.host.delete_user(&self.gear))
            .step("cg_thaw", || self.cgroup.thaw(id))
            .step("cg_delete", || self.cgroup.delete(id))
            .step("stop_traffic_control", || self.host.stop_traffic_control(uid))
            .step("remove_pam_limits", || pam::remove_pam_limits(self.pam_dir(), order, id))
            .run()
    }

    fn start(&self) -> Result<()> {
        self.cgroup.restore(&self.gear.id)?;
        self.refresh_memory_limit();
        Ok(())
    }

    fn set_file_read_only(&self, path: &Path) -> Result<()> {
        self.set_owner(path, 0)
    }

    fn set_file_read_write(&self, path: &Path) -> Result<()> {
        self.set_owner(path, self.gear.uid)
    }

    fn join(&self, exec: Exec) -> Result<Exec> {
        if nix::unistd::getuid().as_raw() == self.gear.uid {
            return Ok(exec);
        }

        let target = self.labeler.target_context(self.gear.uid)?;
        let current = match target {
            Some(_) => self.labeler.query()?,
            None => None,
        };
        let argv = join_command(exec.command(), &self.gear.id, target.as_deref(), current.as_deref());
        Ok(exec.set_command(argv))
    }
}
