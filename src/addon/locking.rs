//! Addon file locking and post-action validation.
//!
//! `metadata/locked_files` lists paths that stay read-only while an addon is
//! running. Entries are relative to the addon directory, or to the gear home
//! when written as `~/...`; a trailing `/` marks a directory. Entries are
//! re-read on every lock and unlock.

use super::{LOCKED_FILES, METADATA_DIR};
use crate::config::types::{GearError, Result};
use crate::gear::{environ, ContainerPlugin, Gear};
use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

static GLOB_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[*?\[\]{}]").expect("valid glob regex"));

/// Dot entries of the home that addons may never claim
static PROTECTED_FILES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.(ssh|tmp|env)").expect("valid protected regex"));

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Lexical normalization: drop `.`, resolve `..` against earlier components
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve one manifest entry to a home-relative path, or `None` when it
/// must be dropped
pub fn resolve_entry(home: &Path, target: &Path, entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    let path = match entry.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => target.join(entry),
    };
    let path = normalize(&path);

    let rel = match path.strip_prefix(home) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => {
            log::warn!("Invalid lock file entry (outside home): {}", entry);
            return None;
        }
    };
    let mut rel = rel;
    if entry.ends_with('/') && !rel.ends_with('/') {
        rel.push('/');
    }

    if rel.starts_with('.') {
        if PROTECTED_FILES.is_match(&rel) {
            log::warn!("Invalid lock file entry (protected): {}", entry);
            return None;
        }
    } else if !path.starts_with(target) && !path.starts_with(home.join("app")) {
        log::warn!("Invalid lock file entry (outside addon and app): {}", entry);
        return None;
    }

    Some(rel)
}

/// Current lock set of the addon at `target`, home-relative
pub fn locked_files(home: &Path, target: &Path) -> Result<BTreeSet<String>> {
    let manifest = target.join(METADATA_DIR).join(LOCKED_FILES);
    let content = match fs::read_to_string(&manifest) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(GearError::fs(&manifest, e)),
    };

    let mut entries = BTreeSet::new();
    let mut patterns = BTreeSet::new();
    for rel in content.lines().filter_map(|l| resolve_entry(home, target, l)) {
        if GLOB_CHARS.is_match(&rel) {
            patterns.insert(rel);
        } else {
            entries.insert(rel);
        }
    }

    if !patterns.is_empty() {
        entries.extend(expand_patterns(home, &patterns)?);
    }
    Ok(entries)
}

fn expand_patterns(home: &Path, patterns: &BTreeSet<String>) -> Result<Vec<String>> {
    let matchers: Vec<Pattern> = patterns
        .iter()
        .filter_map(|p| match Pattern::new(p.trim_end_matches('/')) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                log::warn!("Invalid lock file pattern {}: {}", p, e);
                None
            }
        })
        .collect();
    let prefixes: Vec<PathBuf> = patterns.iter().map(|p| home.join(p)).collect();

    let mut found = Vec::new();
    let walker = WalkDir::new(home)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        // Only descend into directories some pattern can reach
        .filter_entry(|e| !e.file_type().is_dir() || prefixes.iter().any(|p| p.starts_with(e.path())));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Skipping unreadable entry while expanding lock patterns: {}", e);
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(home) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if matchers.iter().any(|m| m.matches_path_with(rel, MATCH_OPTIONS)) {
            found.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(found)
}

/// Create missing entries and hand everything to the gear
pub fn unlock(plugin: &dyn ContainerPlugin, home: &Path, target: &Path, entries: &BTreeSet<String>) -> Result<()> {
    for entry in entries {
        let path = home.join(entry);
        if fs::symlink_metadata(&path).is_err() {
            if entry.ends_with('/') {
                fs::create_dir_all(&path).map_err(|e| GearError::fs(&path, e))?;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                    .map_err(|e| GearError::fs(&path, e))?;
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| GearError::fs(parent, e))?;
                }
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .mode(0o644)
                    .open(&path)
                    .map_err(|e| GearError::fs(&path, e))?;
            }
        }
        plugin.set_file_read_write(&path)?;
    }
    plugin.set_file_read_write(home)?;
    plugin.set_file_read_write(target)
}

/// Take write access on existing entries away from the gear
pub fn lock(plugin: &dyn ContainerPlugin, home: &Path, target: &Path, entries: &BTreeSet<String>) -> Result<()> {
    for entry in entries {
        let path = home.join(entry);
        if fs::symlink_metadata(&path).is_ok() {
            plugin.set_file_read_only(&path)?;
        }
    }
    plugin.set_file_read_only(home)?;
    plugin.set_file_read_only(target)
}

/// Run `action` with the addon's files unlocked, relocking afterwards when
/// `relock` is set, whether or not the action succeeded
pub fn with_unlocked<T>(
    plugin: &dyn ContainerPlugin,
    target: &Path,
    relock: bool,
    action: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let home = plugin.gear().home.clone();
    unlock(plugin, &home, target, &locked_files(&home, target)?)?;

    let result = action();
    if relock {
        let relocked = locked_files(&home, target).and_then(|entries| lock(plugin, &home, target, &entries));
        match (&result, relocked) {
            (Ok(_), Err(e)) => return Err(e),
            (Err(_), Err(e)) => log::warn!("Failed to relock {}: {}", target.display(), e),
            _ => {}
        }
    }
    result
}

/// Non-dot top-level entries of the gear home
pub fn list_home(home: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(home).map_err(|e| GearError::fs(home, e))? {
        let entry = entry.map_err(|e| GearError::fs(home, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Run `action`, then reject new top-level entries in the home and addon
/// variables shadowing gear variables
pub fn validate<T>(gear: &Gear, target: &Path, action: impl FnOnce() -> Result<T>) -> Result<T> {
    let before = list_home(&gear.home)?;
    let value = action()?;
    let after = list_home(&gear.home)?;

    let created: Vec<String> = after.difference(&before).cloned().collect();
    if !created.is_empty() {
        return Err(GearError::InvariantViolation(format!(
            "Add-on created the following files or directories in the home directory: {}",
            created.join(", ")
        )));
    }

    let mut gear_keys: BTreeSet<String> = environ::list(&gear.env_dir())?.into_iter().collect();
    gear_keys.extend(environ::list(&gear.user_env_dir())?);
    let addon_keys: BTreeSet<String> = environ::list(&target.join(super::ENV_DIR))?.into_iter().collect();
    let overridden: Vec<String> = gear_keys.intersection(&addon_keys).cloned().collect();
    if !overridden.is_empty() {
        return Err(GearError::InvariantViolation(format!(
            "Add-on attempted to override the following environment variables: {}",
            overridden.join(", ")
        )));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Exec;
    use crate::safety::cleanup::CleanupReport;
    use std::sync::Mutex;

    /// Plugin double recording ownership changes
    struct RecordingPlugin {
        gear: Gear,
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    impl RecordingPlugin {
        fn new(home: &Path) -> Self {
            Self {
                gear: Gear::new("g1", 1001, "small", "d", home),
                calls: Mutex::new(Vec::new()),
            }
        }
        fn calls(&self, kind: &str) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == kind)
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
            self.calls.lock().unwrap().push(("ro".to_string(), path.to_path_buf()));
            Ok(())
        }
        fn set_file_read_write(&self, path: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(("rw".to_string(), path.to_path_buf()));
            Ok(())
        }
        fn join(&self, exec: Exec) -> Result<Exec> {
            Ok(exec)
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/h/php/../app/./x")), PathBuf::from("/h/app/x"));
        assert_eq!(normalize(Path::new("/h/php/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_resolve_entries() {
        let home = Path::new("/home/g1");
        let target = Path::new("/home/g1/php");

        assert_eq!(resolve_entry(home, target, "conf/php.ini").as_deref(), Some("php/conf/php.ini"));
        assert_eq!(resolve_entry(home, target, "logs/").as_deref(), Some("php/logs/"));
        assert_eq!(resolve_entry(home, target, "~/app/config.php").as_deref(), Some("app/config.php"));
        assert_eq!(resolve_entry(home, target, "~/.pearrc").as_deref(), Some(".pearrc"));
        assert_eq!(resolve_entry(home, target, "  "), None);
        // outside home
        assert_eq!(resolve_entry(home, target, "../../etc/passwd"), None);
        // protected dotfiles
        assert_eq!(resolve_entry(home, target, "~/.ssh/authorized_keys"), None);
        assert_eq!(resolve_entry(home, target, "~/.env/PATH"), None);
        assert_eq!(resolve_entry(home, target, "../.tmp/x"), None);
        // another addon's directory
        assert_eq!(resolve_entry(home, target, "../mysql/conf"), None);
    }

    #[test]
    fn test_locked_files_expand_globs() {
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("php");
        fs::create_dir_all(target.join("metadata")).unwrap();
        fs::create_dir_all(target.join("conf/extra")).unwrap();
        fs::write(target.join("conf/a.ini"), "").unwrap();
        fs::write(target.join("conf/b.ini"), "").unwrap();
        fs::write(target.join("conf/extra/c.ini"), "").unwrap();
        fs::write(
            target.join("metadata/locked_files"),
            "conf/*.ini\nlogs/\n~/.ssh/\n../../outside\n~/app/index.php\n",
        )
        .unwrap();

        let entries = locked_files(home.path(), &target).unwrap();
        let expected: BTreeSet<String> = ["php/conf/a.ini", "php/conf/b.ini", "php/logs/", "app/index.php"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_unlock_creates_missing_entries_then_lock() {
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("php");
        fs::create_dir_all(&target).unwrap();
        let plugin = RecordingPlugin::new(home.path());

        let entries: BTreeSet<String> = ["php/logs/", "php/run/app.pid"].iter().map(|s| s.to_string()).collect();
        unlock(&plugin, home.path(), &target, &entries).unwrap();

        assert!(target.join("logs").is_dir());
        let pid = fs::metadata(target.join("run/app.pid")).unwrap();
        assert!(pid.is_file());
        assert_eq!(pid.permissions().mode() & 0o111, 0);
        let rw = plugin.calls("rw");
        assert_eq!(rw.len(), 4);
        assert_eq!(rw[2], home.path());
        assert_eq!(rw[3], target);

        fs::remove_file(target.join("run/app.pid")).unwrap();
        lock(&plugin, home.path(), &target, &entries).unwrap();
        // the missing pid file is skipped
        assert_eq!(plugin.calls("ro"), vec![home.path().join("php/logs/"), home.path().to_path_buf(), target.clone()]);
    }

    #[test]
    fn test_with_unlocked_relocks_after_failure() {
        let home = tempfile::tempdir().unwrap();
        let target = home.path().join("php");
        fs::create_dir_all(&target).unwrap();
        let plugin = RecordingPlugin::new(home.path());

        let result: Result<()> = with_unlocked(&plugin, &target, true, || {
            Err(GearError::Conflict("boom".to_string()))
        });
        assert!(matches!(result, Err(GearError::Conflict(_))));
        assert_eq!(plugin.calls("ro").len(), 2);

        let plugin = RecordingPlugin::new(home.path());
        with_unlocked(&plugin, &target, false, || Ok(())).unwrap();
        assert!(plugin.calls("ro").is_empty());
    }

    #[test]
    fn test_validate_rejects_stray_entries() {
        let home = tempfile::tempdir().unwrap();
        let gear = Gear::new("g1", 1001, "small", "d", home.path());
        let target = home.path().join("php");
        fs::create_dir_all(&target).unwrap();

        let err = validate(&gear, &target, || {
            fs::write(home.path().join("stray.txt"), "x").unwrap();
            fs::write(home.path().join(".hidden"), "x").unwrap();
            Ok(())
        })
        .unwrap_err();
        match err {
            GearError::InvariantViolation(msg) => {
                assert!(msg.contains("stray.txt"));
                assert!(!msg.contains(".hidden"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_env_override() {
        let home = tempfile::tempdir().unwrap();
        let gear = Gear::new("g1", 1001, "small", "d", home.path());
        let target = home.path().join("php");
        fs::create_dir_all(&target).unwrap();
        environ::add(&gear.env_dir(), "FRAMEWORK", "php", false).unwrap();
        environ::add(&gear.user_env_dir(), "APP_MODE", "dev", false).unwrap();

        let err = validate(&gear, &target, || {
            environ::add(&target.join("env"), "APP_MODE", "prod", false)?;
            environ::add(&target.join("env"), "PHP_DIR", "/x", false)
        })
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("APP_MODE"));
        assert!(!msg.contains("PHP_DIR"));
    }
}
