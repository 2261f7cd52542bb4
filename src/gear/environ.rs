//! Per-gear environment variable store.
//!
//! One file per variable, the filename being the uppercased key and the
//! content the value. Exported keys are also listed in `.exported`.

use super::Gear;
use crate::config::types::{GearError, Result};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;

/// Listing of variables exported to the application
pub const EXPORTED_FILE: &str = ".exported";

/// Read every variable in `dir`; a missing directory is empty
pub fn load(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(env),
        Err(e) => return Err(GearError::fs(dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| GearError::fs(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        let value = std::fs::read_to_string(entry.path())
            .map_err(|e| GearError::fs(&entry.path(), e))?;
        env.insert(name, value.trim_end_matches('\n').to_string());
    }
    Ok(env)
}

/// Keys defined in `dir`, sorted
pub fn list(dir: &Path) -> Result<Vec<String>> {
    Ok(load(dir)?.into_keys().collect())
}

fn exported_keys(dir: &Path) -> Result<Vec<String>> {
    let path = dir.join(EXPORTED_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(GearError::fs(&path, e)),
    }
}

/// Set a variable, creating the directory if needed
pub fn add(dir: &Path, key: &str, value: &str, exported: bool) -> Result<()> {
    let key = key.to_uppercase();
    if key.is_empty() || key.contains('/') || key.starts_with('.') {
        return Err(GearError::Config(format!("Invalid environment variable name '{}'", key)));
    }

    std::fs::create_dir_all(dir).map_err(|e| GearError::fs(dir, e))?;
    let path = dir.join(&key);
    std::fs::write(&path, value).map_err(|e| GearError::fs(&path, e))?;

    if exported && !exported_keys(dir)?.contains(&key) {
        let list = dir.join(EXPORTED_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&list)
            .map_err(|e| GearError::fs(&list, e))?;
        writeln!(file, "{}", key).map_err(|e| GearError::fs(&list, e))?;
    }
    Ok(())
}

/// Delete a variable; absence is not an error
pub fn remove(dir: &Path, key: &str) -> Result<()> {
    let key = key.to_uppercase();
    let path = dir.join(&key);
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(GearError::fs(&path, e)),
    }

    let exported = exported_keys(dir)?;
    if exported.contains(&key) {
        let kept: Vec<String> = exported.into_iter().filter(|k| *k != key).collect();
        let list = dir.join(EXPORTED_FILE);
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&list, body).map_err(|e| GearError::fs(&list, e))?;
    }
    Ok(())
}

/// Addon `env/` directories in name order
fn addon_env_dirs(gear: &Gear) -> Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    let entries = match std::fs::read_dir(&gear.home) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(GearError::fs(&gear.home, e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let env = entry.path().join("env");
        if entry.path().join("metadata").is_dir() && env.is_dir() {
            dirs.push(env);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Full environment of a gear: user variables, then every addon's
/// variables, then platform variables, later layers winning.
pub fn load_all(gear: &Gear) -> Result<BTreeMap<String, String>> {
    let mut env = load(&gear.user_env_dir())?;
    for dir in addon_env_dirs(gear)? {
        env.extend(load(&dir)?);
    }
    env.extend(load(&gear.env_dir())?);
    Ok(env)
}

/// Environment an addon's actions run with: the gear environment
/// overlaid with the addon's own variables
pub fn load_for_addon(gear: &Gear, addon_dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut env = load_all(gear)?;
    env.extend(load(&addon_dir.join("env"))?);
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_add_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join(".env");
        add(&env, "php_ip", "127.0.0.1", false).unwrap();
        add(&env, "PATH_EXTRA", "/opt/bin\n", true).unwrap();
        add(&env, "PATH_EXTRA", "/opt/bin", true).unwrap();

        let vars = load(&env).unwrap();
        assert_eq!(vars.get("PHP_IP").map(String::as_str), Some("127.0.0.1"));
        assert_eq!(vars.get("PATH_EXTRA").map(String::as_str), Some("/opt/bin"));
        assert_eq!(list(&env).unwrap(), vec!["PATH_EXTRA", "PHP_IP"]);
        assert_eq!(fs::read_to_string(env.join(EXPORTED_FILE)).unwrap(), "PATH_EXTRA\n");

        remove(&env, "path_extra").unwrap();
        remove(&env, "MISSING").unwrap();
        assert_eq!(list(&env).unwrap(), vec!["PHP_IP"]);
        assert_eq!(fs::read_to_string(env.join(EXPORTED_FILE)).unwrap(), "");
    }

    #[test]
    fn test_missing_dir_is_empty() {
        assert!(load(Path::new("/nonexistent/gearbox/env")).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key() {
        let dir = tempfile::tempdir().unwrap();
        assert!(add(dir.path(), "../x", "v", false).is_err());
        assert!(add(dir.path(), "", "v", false).is_err());
    }

    #[test]
    fn test_load_all_layering() {
        let home = tempfile::tempdir().unwrap();
        let gear = Gear::new("g1", 1001, "small", "d", home.path());

        add(&gear.user_env_dir(), "LAYER", "user", false).unwrap();
        add(&gear.user_env_dir(), "USER_ONLY", "u", false).unwrap();

        for name in ["mysql", "php"] {
            fs::create_dir_all(home.path().join(name).join("metadata")).unwrap();
            add(&home.path().join(name).join("env"), "LAYER", name, false).unwrap();
        }
        // Not an addon: no metadata directory
        add(&home.path().join("stray").join("env"), "LAYER", "stray", false).unwrap();

        let all = load_all(&gear).unwrap();
        assert_eq!(all.get("LAYER").map(String::as_str), Some("php"));
        assert_eq!(all.get("USER_ONLY").map(String::as_str), Some("u"));

        add(&gear.env_dir(), "LAYER", "gear", false).unwrap();
        let all = load_all(&gear).unwrap();
        assert_eq!(all.get("LAYER").map(String::as_str), Some("gear"));

        let mysql = load_for_addon(&gear, &home.path().join("mysql")).unwrap();
        assert_eq!(mysql.get("LAYER").map(String::as_str), Some("mysql"));
    }
}
