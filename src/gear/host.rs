//! Host side effects of the gear lifecycle.
//!
//! Account management, signals, traffic shaping and quotas all need root and
//! real system tools; [`HostOps`] lets the lifecycle drive them through one
//! seam so it can be exercised with failure-injecting doubles.

use super::Gear;
use crate::config::settings::NodeConfig;
use crate::config::types::Result;
use crate::kernel::account::{self, AccountSpec};
use crate::kernel::quota::{self, QuotaRecord};
use crate::kernel::signal;
use crate::kernel::traffic::TrafficControl;
use std::time::Duration;

pub trait HostOps: Send + Sync {
    fn create_user(&self, gear: &Gear) -> Result<()>;
    fn delete_user(&self, gear: &Gear) -> Result<()>;
    fn create_home(&self, gear: &Gear) -> Result<()>;
    fn kill_user_processes(&self, uid: u32) -> Result<()>;
    fn kill_pid(&self, pid: i32) -> Result<()>;
    fn pause(&self, duration: Duration);
    fn start_traffic_control(&self, uid: u32) -> Result<()>;
    fn stop_traffic_control(&self, uid: u32) -> Result<()>;
    fn current_quota(&self, gear: &Gear) -> Result<Option<QuotaRecord>>;
    fn set_quota(&self, gear: &Gear, blocks: u64, files: u64) -> Result<()>;
}

/// [`HostOps`] backed by the real system
pub struct SystemHost {
    shell: String,
    traffic: TrafficControl,
}

impl SystemHost {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            shell: config.gear_shell.clone(),
            traffic: TrafficControl::new(&config.traffic),
        }
    }
}

impl HostOps for SystemHost {
    fn create_user(&self, gear: &Gear) -> Result<()> {
        let comment = format!("gear {}", gear.domain);
        account::create_user(&AccountSpec {
            name: &gear.id,
            uid: gear.uid,
            home: &gear.home,
            shell: &self.shell,
            comment: &comment,
        })
    }

    fn delete_user(&self, gear: &Gear) -> Result<()> {
        account::delete_user(&gear.id, &gear.home)
    }

    fn create_home(&self, gear: &Gear) -> Result<()> {
        account::create_home(&gear.home, gear.uid, gear.gid())
    }

    fn kill_user_processes(&self, uid: u32) -> Result<()> {
        signal::kill_user_processes(uid)
    }

    fn kill_pid(&self, pid: i32) -> Result<()> {
        signal::kill_pid(pid)
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn start_traffic_control(&self, uid: u32) -> Result<()> {
        self.traffic.start(uid)
    }

    fn stop_traffic_control(&self, uid: u32) -> Result<()> {
        self.traffic.stop(uid)
    }

    fn current_quota(&self, gear: &Gear) -> Result<Option<QuotaRecord>> {
        quota::get_quota(&gear.id)
    }

    fn set_quota(&self, gear: &Gear, blocks: u64, files: u64) -> Result<()> {
        let mountpoint = quota::mountpoint(&gear.home)?;
        quota::set_quota(&gear.id, blocks, files, &mountpoint)
    }
}
