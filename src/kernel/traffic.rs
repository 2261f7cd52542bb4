//! Per-gear traffic shaping with `tc` HTB classes.
//!
//! Each gear owns one class `1:<uid in hex>` under the root qdisc of the
//! configured device.

use crate::config::settings::TrafficSettings;
use crate::config::types::{GearError, Result};
use crate::exec::Exec;

pub struct TrafficControl {
    settings: TrafficSettings,
}

impl TrafficControl {
    pub fn new(settings: &TrafficSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn class_id(uid: u32) -> Result<String> {
        // tc minor numbers are 16 bits wide
        if uid > 0xFFFF {
            return Err(GearError::OutOfRange(format!(
                "UID {} does not fit a traffic class id",
                uid
            )));
        }
        Ok(format!("1:{:x}", uid))
    }

    /// Argument vector creating the gear's class
    pub fn start_command(&self, uid: u32) -> Result<Exec> {
        Ok(Exec::new("tc")
            .args(["class", "add", "dev", self.settings.device.as_str()])
            .args(["parent", "1:", "classid"])
            .arg(Self::class_id(uid)?)
            .args(["htb", "rate", self.settings.rate.as_str()])
            .args(["ceil", self.settings.ceil.as_str()])
            .silent_io())
    }

    /// Argument vector removing the gear's class
    pub fn stop_command(&self, uid: u32) -> Result<Exec> {
        Ok(Exec::new("tc")
            .args(["class", "del", "dev", self.settings.device.as_str()])
            .args(["parent", "1:", "classid"])
            .arg(Self::class_id(uid)?)
            .silent_io())
    }

    pub fn start(&self, uid: u32) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        log::debug!("Starting traffic control for uid {}", uid);
        self.start_command(uid)?.run()
    }

    pub fn stop(&self, uid: u32) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        log::debug!("Stopping traffic control for uid {}", uid);
        self.stop_command(uid)?.run()
    }
}
