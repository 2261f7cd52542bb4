//! Process termination helpers.

use crate::config::types::Result;
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;

/// SIGKILL one process. A process that already exited is not an error.
pub fn kill_pid(pid: i32) -> Result<()> {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Real uid of a process from `/proc/<pid>/status`
fn process_uid(status_path: &Path) -> Option<u32> {
    let status = std::fs::read_to_string(status_path).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Pids whose real uid is `uid`, scanning the given procfs root
pub fn list_user_pids_in(proc_root: &Path, uid: u32) -> Result<Vec<i32>> {
    let mut pids = Vec::new();
    for entry in std::fs::read_dir(proc_root)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let pid: i32 = match entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        // Processes may exit while we scan
        if process_uid(&entry.path().join("status")) == Some(uid) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

pub fn list_user_pids(uid: u32) -> Result<Vec<i32>> {
    list_user_pids_in(Path::new("/proc"), uid)
}

/// SIGKILL every process owned by `uid`. Refuses to act on root.
pub fn kill_user_processes(uid: u32) -> Result<()> {
    if uid == 0 {
        return Err(crate::config::types::GearError::Config(
            "Refusing to kill processes of uid 0".to_string(),
        ));
    }

    let pids = list_user_pids(uid)?;
    debug!("Killing {} processes of uid {}", pids.len(), uid);
    for pid in pids {
        kill_pid(pid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_procfs_scan() {
        let root = tempfile::tempdir().unwrap();
        for (pid, uid) in [(10, 1001), (11, 1002), (12, 1001)] {
            let dir = root.path().join(pid.to_string());
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(
                dir.join("status"),
                format!("Name:\tsh\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
            )
            .unwrap();
        }
        std::fs::create_dir(root.path().join("self")).unwrap();

        assert_eq!(list_user_pids_in(root.path(), 1001).unwrap(), vec![10, 12]);
        assert!(list_user_pids_in(root.path(), 1003).unwrap().is_empty());
    }

    #[test]
    fn test_own_process_is_listed() {
        let uid = nix::unistd::getuid().as_raw();
        let pids = list_user_pids(uid).unwrap();
        assert!(pids.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn test_kill_pid_terminates_child() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        kill_pid(child.id() as i32).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_refuses_root() {
        assert!(kill_user_processes(0).is_err());
    }
}
