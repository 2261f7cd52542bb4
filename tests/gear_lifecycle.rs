//! Integration tests for the gear lifecycle
//!
//! Drives the Linux plugin against a cgroup v2 hierarchy laid out in a
//! scratch directory, with host side effects replaced by a recording double.

use gearbox::config::profile::ResourceProfile;
use gearbox::config::settings::{CgroupSettings, NodeConfig, SelinuxSettings};
use gearbox::config::types::{GearError, Result};
use gearbox::gear::{environ, ContainerPlugin, Gear, GearRecord, HostOps, LinuxPlugin};
use gearbox::kernel::cgroup::{CgroupBackend, CgroupV2};
use gearbox::kernel::quota::QuotaRecord;
use gearbox::kernel::selinux::SecurityLabeler;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PROFILE: &str = r#"{
    "profiles": {
        "small": {
            "quota": {"blocks": 4096, "files": 1000},
            "cgroup": {"memory.limit_in_bytes": "536870912", "cpu.shares": "1024"},
            "limits": {"nofile": "4096", "nproc": "0"}
        }
    }
}"#;

/// Host double creating the home directory and failing on request
#[derive(Default)]
struct ScratchHost {
    calls: Mutex<Vec<&'static str>>,
    fail_all: bool,
}

impl ScratchHost {
    fn record(&self, name: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(name);
        if self.fail_all {
            return Err(GearError::ExternalTool {
                command: name.to_string(),
                status: Some(1),
                stderr: "injected".to_string(),
            });
        }
        Ok(())
    }
}

impl HostOps for ScratchHost {
    fn create_user(&self, _gear: &Gear) -> Result<()> {
        self.record("create_user")
    }
    fn delete_user(&self, gear: &Gear) -> Result<()> {
        self.record("delete_user")?;
        std::fs::remove_dir_all(&gear.home).map_err(|e| GearError::fs(&gear.home, e))
    }
    fn create_home(&self, gear: &Gear) -> Result<()> {
        self.record("create_home")?;
        std::fs::create_dir_all(gear.app_dir()).map_err(|e| GearError::fs(&gear.home, e))
    }
    fn kill_user_processes(&self, _uid: u32) -> Result<()> {
        self.record("kill_user_processes")
    }
    fn kill_pid(&self, _pid: i32) -> Result<()> {
        self.record("kill_pid")
    }
    fn pause(&self, _duration: Duration) {}
    fn start_traffic_control(&self, _uid: u32) -> Result<()> {
        self.record("start_traffic_control")
    }
    fn stop_traffic_control(&self, _uid: u32) -> Result<()> {
        self.record("stop_traffic_control")
    }
    fn current_quota(&self, _gear: &Gear) -> Result<Option<QuotaRecord>> {
        self.record("current_quota")?;
        Ok(None)
    }
    fn set_quota(&self, _gear: &Gear, _blocks: u64, _files: u64) -> Result<()> {
        self.record("set_quota")
    }
}

struct Node {
    _dir: tempfile::TempDir,
    config: Arc<NodeConfig>,
    cgroup: Arc<CgroupV2>,
}

fn node(root: &Path) -> NodeConfig {
    NodeConfig {
        gear_base_dir: root.join("gears"),
        var_dir: root.join("var"),
        run_dir: root.join("run"),
        pam_limits_dir: root.join("limits.d"),
        proxy_dir: root.join("proxy"),
        cgroup: CgroupSettings {
            enabled: Some(true),
            force_v1: false,
            root: root.join("cgroup"),
            slice: "gearbox".to_string(),
            state_dir: root.join("var/cgroup"),
        },
        selinux: SelinuxSettings {
            enabled: Some(false),
            ..SelinuxSettings::default()
        },
        ..NodeConfig::default()
    }
}

fn setup() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let config = node(dir.path());
    std::fs::create_dir_all(&config.pam_limits_dir).unwrap();
    std::fs::create_dir_all(config.cgroup.root.join("gearbox")).unwrap();
    let cgroup = Arc::new(CgroupV2::new(&config.cgroup));
    Node {
        _dir: dir,
        config: Arc::new(config),
        cgroup,
    }
}

fn plugin(node: &Node, host: Arc<ScratchHost>) -> LinuxPlugin {
    let gear = Gear::new("g1", 1001, "small", "g1.example.com", node.config.gear_home("g1"));
    LinuxPlugin::new(
        gear,
        node.config.clone(),
        Arc::new(ResourceProfile::from_json(PROFILE).unwrap()),
        host,
        node.cgroup.clone(),
        Arc::new(SecurityLabeler::new(&node.config.selinux)),
    )
}

#[test]
fn test_create_start_destroy() {
    let node = setup();
    let host = Arc::new(ScratchHost::default());
    let plugin = plugin(&node, host.clone());
    let gear = plugin.gear().clone();

    plugin.create().unwrap();
    GearRecord::from(&gear).save(&node.config.gear_records_dir()).unwrap();

    let group = node.cgroup.get_cgroup_path("g1");
    assert_eq!(std::fs::read_to_string(group.join("memory.max")).unwrap(), "536870912");
    assert_eq!(std::fs::read_to_string(group.join("cpu.weight")).unwrap(), "39");
    let env = environ::load(&gear.env_dir()).unwrap();
    assert_eq!(env.get("MEMORY_LIMIT").map(String::as_str), Some("512"));
    let limits = std::fs::read_to_string(node.config.pam_limits_dir.join("85-g1.conf")).unwrap();
    assert!(limits.contains("g1\thard\tnproc\t0"));

    // Simulate a reboot wiping the hierarchy, then restore from the snapshot
    std::fs::remove_dir_all(&group).unwrap();
    plugin.start().unwrap();
    assert_eq!(std::fs::read_to_string(group.join("memory.max")).unwrap(), "536870912");

    let record = GearRecord::load(&node.config.gear_records_dir(), "g1").unwrap();
    assert_eq!(record.to_gear(&node.config), gear);

    let report = plugin.destroy();
    // A scratch directory cannot be rmdir'ed while it holds control files
    assert_eq!(report.failed_steps(), vec!["cg_delete"]);
    assert_eq!(report.attempted.len(), 8);
    assert!(!gear.home.exists());
    assert!(!node.config.pam_limits_dir.join("85-g1.conf").exists());
}

#[test]
fn test_destroy_with_every_host_call_failing() {
    let node = setup();
    let host = Arc::new(ScratchHost {
        fail_all: true,
        ..ScratchHost::default()
    });
    let plugin = plugin(&node, host.clone());

    let report = plugin.destroy();
    assert_eq!(report.attempted.len(), 8);
    for step in ["kill_procs", "kill_procs_again", "delete_user", "stop_traffic_control"] {
        assert!(report.failed_steps().contains(&step), "{} should have failed", step);
    }
    let calls = host.calls.lock().unwrap().clone();
    assert_eq!(calls.iter().filter(|c| **c == "kill_user_processes").count(), 2);
}

#[test]
fn test_failed_create_leaves_nothing_behind() {
    let node = setup();
    let host = Arc::new(ScratchHost {
        fail_all: true,
        ..ScratchHost::default()
    });
    let plugin = plugin(&node, host.clone());

    assert!(matches!(plugin.create(), Err(GearError::ExternalTool { .. })));
    assert!(!node.cgroup.get_cgroup_path("g1").exists());
    assert!(!node.config.pam_limits_dir.join("85-g1.conf").exists());
    let calls = host.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["create_user", "delete_user", "stop_traffic_control"]);
}
