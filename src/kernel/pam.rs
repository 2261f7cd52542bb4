//! PAM resource limits files.
//!
//! One file per gear under the limits directory, named `<order>-<gear>.conf`,
//! holding `<gear>\t<soft|hard>\t<name>\t<value>` lines.

use crate::config::types::{GearError, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Limit names in the order they are written
pub const PAM_LIMIT_NAMES: &[&str] = &[
    "core",
    "data",
    "fsize",
    "memlock",
    "nofile",
    "rss",
    "cpu",
    "nproc",
    "as",
    "maxlogins",
    "priority",
    "locks",
    "sigpending",
    "msgqueue",
    "nice",
    "rtprio",
];

/// Limits written as soft limits unless their value is "0"
const PAM_SOFT_LIMITS: &[&str] = &["nproc"];

pub fn pam_limits_path(dir: &Path, order: u32, gear_id: &str) -> PathBuf {
    dir.join(format!("{}-{}.conf", order, gear_id))
}

fn limit_type(name: &str, value: &str) -> &'static str {
    if PAM_SOFT_LIMITS.contains(&name) && value != "0" {
        "soft"
    } else {
        "hard"
    }
}

/// Render the limits file body for a gear
pub fn render_pam_limits(gear_id: &str, limits: &BTreeMap<String, String>) -> String {
    let mut out = format!("# PAM process limits for gear {}\n", gear_id);
    for name in PAM_LIMIT_NAMES {
        if let Some(value) = limits.get(*name) {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}",
                gear_id,
                limit_type(name, value),
                name,
                value
            );
        }
    }
    out
}

pub fn write_pam_limits(
    dir: &Path,
    order: u32,
    gear_id: &str,
    limits: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let path = pam_limits_path(dir, order, gear_id);
    std::fs::write(&path, render_pam_limits(gear_id, limits))
        .map_err(|e| GearError::fs(&path, e))?;
    log::debug!("Wrote PAM limits {}", path.display());
    Ok(path)
}

/// Remove the limits file; absence is not an error
pub fn remove_pam_limits(dir: &Path, order: u32, gear_id: &str) -> Result<()> {
    let path = pam_limits_path(dir, order, gear_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GearError::fs(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_nproc_zero_is_hard() {
        let body = render_pam_limits("g1", &limits(&[("nofile", "4096"), ("nproc", "0")]));
        let lines: Vec<&str> = body.lines().skip(1).collect();
        assert_eq!(lines, vec!["g1\thard\tnofile\t4096", "g1\thard\tnproc\t0"]);
    }

    #[test]
    fn test_nproc_nonzero_is_soft() {
        let body = render_pam_limits("g1", &limits(&[("nproc", "250")]));
        assert!(body.contains("g1\tsoft\tnproc\t250\n"));
    }

    #[test]
    fn test_fixed_order_ignores_map_order() {
        let body = render_pam_limits("g1", &limits(&[("rtprio", "0"), ("core", "0")]));
        let names: Vec<&str> = body
            .lines()
            .skip(1)
            .map(|l| l.split('\t').nth(2).unwrap())
            .collect();
        assert_eq!(names, vec!["core", "rtprio"]);
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_pam_limits(dir.path(), 85, "g1", &limits(&[("nofile", "64")])).unwrap();
        assert_eq!(path, dir.path().join("85-g1.conf"));
        assert!(path.exists());

        remove_pam_limits(dir.path(), 85, "g1").unwrap();
        assert!(!path.exists());
        // idempotent
        remove_pam_limits(dir.path(), 85, "g1").unwrap();
    }
}
