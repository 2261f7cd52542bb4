//! Gear system accounts and home skeletons.
//!
//! A gear is a dedicated user and group sharing the gear uid. The home
//! directory is not created by `useradd`; the skeleton is laid out here.

use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use nix::unistd::{chown, Gid, Uid};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Gear-private environment directory inside the home
pub const ENV_DIR: &str = ".env";
/// Gear-private scratch directory inside the home
pub const TMP_DIR: &str = ".tmp";
/// Application directory inside the home
pub const APP_DIR: &str = "app";

/// Account parameters for one gear
#[derive(Debug, Clone, Copy)]
pub struct AccountSpec<'a> {
    pub name: &'a str,
    pub uid: u32,
    pub home: &'a Path,
    pub shell: &'a str,
    pub comment: &'a str,
}

pub fn groupadd_command(spec: &AccountSpec<'_>) -> Exec {
    Exec::new("groupadd")
        .args(["-g".to_string(), spec.uid.to_string()])
        .arg(spec.name)
        .silent_io()
}

pub fn useradd_command(spec: &AccountSpec<'_>) -> Exec {
    Exec::new("useradd")
        .args(["-u".to_string(), spec.uid.to_string()])
        .args(["-g".to_string(), spec.uid.to_string()])
        .arg("-d")
        .path_arg(spec.home)
        .args(["-s", spec.shell, "-c", spec.comment, "-M"])
        .arg(spec.name)
        .silent_io()
}

/// Exit status of `userdel`/`groupdel` for an unknown user or group
const NO_SUCH_ACCOUNT: i32 = 6;

/// Create the gear's group and user. A group created for a user that could
/// not be added is deleted again.
pub fn create_user(spec: &AccountSpec<'_>) -> Result<()> {
    if spec.uid == 0 {
        return Err(GearError::Config(format!(
            "Gear {} cannot be created with uid 0",
            spec.name
        )));
    }
    groupadd_command(spec).run()?;
    if let Err(e) = useradd_command(spec).run() {
        if let Err(cleanup) = delete_group(spec.name) {
            log::warn!("Failed to delete group {}: {}", spec.name, cleanup);
        }
        return Err(e);
    }
    log::info!("Created account {} (uid={})", spec.name, spec.uid);
    Ok(())
}

/// Run an account deletion tool, treating an unknown account as deleted
fn run_delete(exec: Exec) -> Result<()> {
    match exec.run() {
        Err(GearError::ExternalTool {
            status: Some(NO_SUCH_ACCOUNT),
            command,
            ..
        }) => {
            log::debug!("{}: no such account", command);
            Ok(())
        }
        other => other,
    }
}

pub fn userdel_command(name: &str) -> Exec {
    Exec::new("userdel").args(["-f", name]).silent_io()
}

pub fn groupdel_command(name: &str) -> Exec {
    Exec::new("groupdel").arg(name).silent_io()
}

pub fn delete_group(name: &str) -> Result<()> {
    run_delete(groupdel_command(name))
}

/// Delete the gear's user and group and remove the home tree.
///
/// Every step is attempted; the first failure is returned afterwards, so a
/// retry after a partial delete converges.
pub fn delete_user(name: &str, home: &Path) -> Result<()> {
    let results = [
        run_delete(userdel_command(name)),
        // userdel keeps the group when it is not a user private group, or
        // when the user never existed
        delete_group(name),
        remove_home(home),
    ];
    for result in &results {
        if let Err(e) = result {
            log::warn!("Deleting account {}: {}", name, e);
        }
    }
    results.into_iter().collect::<Result<Vec<()>>>()?;
    log::info!("Deleted account {}", name);
    Ok(())
}

/// Remove a home tree; absence is not an error
pub fn remove_home(home: &Path) -> Result<()> {
    match std::fs::remove_dir_all(home) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GearError::fs(home, e)),
    }
}

pub fn chown_path(path: &Path, uid: u32, gid: u32) -> Result<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| GearError::fs(path, e))
}

fn make_dir(path: &Path, mode: u32) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(GearError::fs(path, e)),
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| GearError::fs(path, e))
}

/// Lay out the home skeleton.
///
/// The home and `.env` are group-readable only; `.env` belongs to root so
/// the gear cannot rewrite its own platform variables.
pub fn create_home(home: &Path, uid: u32, gid: u32) -> Result<()> {
    make_dir(home, 0o750)?;
    chown_path(home, uid, gid)?;

    let env = home.join(ENV_DIR);
    make_dir(&env, 0o750)?;
    chown_path(&env, 0, gid)?;

    for dir in [TMP_DIR, APP_DIR] {
        let path = home.join(dir);
        make_dir(&path, 0o750)?;
        chown_path(&path, uid, gid)?;
    }

    log::debug!("Created home skeleton {}", home.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(home: &Path) -> AccountSpec<'_> {
        AccountSpec {
            name: "g1",
            uid: 1001,
            home,
            shell: "/bin/bash",
            comment: "gear g1",
        }
    }

    #[test]
    fn test_useradd_arguments() {
        let home = PathBuf::from("/var/lib/gearbox/gears/g1");
        let exec = useradd_command(&spec(&home));
        assert_eq!(
            exec.command(),
            &[
                "useradd", "-u", "1001", "-g", "1001", "-d", "/var/lib/gearbox/gears/g1", "-s",
                "/bin/bash", "-c", "gear g1", "-M", "g1"
            ]
        );
        assert_eq!(groupadd_command(&spec(&home)).command(), &["groupadd", "-g", "1001", "g1"]);
    }

    #[test]
    fn test_root_uid_rejected() {
        let home = PathBuf::from("/nonexistent");
        let mut s = spec(&home);
        s.uid = 0;
        assert!(matches!(create_user(&s), Err(GearError::Config(_))));
    }

    #[test]
    fn test_home_skeleton_as_self() {
        let base = tempfile::tempdir().unwrap();
        let home = base.path().join("g1");
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        // chown to root only succeeds when privileged
        let result = create_home(&home, uid, gid);
        if uid != 0 {
            assert!(result.is_err());
            return;
        }
        result.unwrap();
        for dir in [ENV_DIR, TMP_DIR, APP_DIR] {
            assert!(home.join(dir).is_dir());
        }
        let mode = std::fs::metadata(&home).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_delete_commands() {
        assert_eq!(userdel_command("g1").command(), &["userdel", "-f", "g1"]);
        assert_eq!(groupdel_command("g1").command(), &["groupdel", "g1"]);
    }

    #[test]
    fn test_delete_missing_user_still_removes_home() {
        let base = tempfile::tempdir().unwrap();
        let home = base.path().join("g1");
        std::fs::create_dir_all(home.join("app/.gear")).unwrap();
        std::fs::write(home.join("app/index.php"), "x").unwrap();

        let result = delete_user("gearbox-test-no-such-user", &home);
        assert!(!home.exists());
        // An unknown account counts as deleted; without privileges or the
        // shadow tools the failure is still reported after the home is gone
        if nix::unistd::getuid().is_root() && result.is_err() {
            assert!(!matches!(result, Err(GearError::ExternalTool { status: Some(6), .. })));
        }
    }

    #[test]
    fn test_remove_missing_home_is_ok() {
        remove_home(Path::new("/nonexistent/gearbox/home")).unwrap();
    }
}
