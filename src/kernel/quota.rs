//! Disk quota management through the `quota`/`setquota` tools.

use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Current usage and limits of one user on one filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    pub used_blocks: u64,
    pub soft_blocks: u64,
    pub hard_blocks: u64,
    pub used_files: u64,
    pub soft_files: u64,
    pub hard_files: u64,
}

impl QuotaRecord {
    /// True when current usage already exceeds the given limits
    pub fn exceeds(&self, max_blocks: u64, max_files: u64) -> bool {
        self.used_blocks > max_blocks || self.used_files > max_files
    }
}

fn parse_field(field: &str) -> Option<u64> {
    // Over-quota values carry a trailing '*'
    field.trim_end_matches('*').parse().ok()
}

/// Parse `quota -pw <user>` output.
///
/// The first line naming a `/dev/` device is used; its columns are
/// `fs blocks quota limit grace files quota limit grace`.
pub fn parse_quota_output(output: &str) -> Option<QuotaRecord> {
    let line = output.lines().find(|line| line.contains("/dev/"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    Some(QuotaRecord {
        used_blocks: parse_field(fields[1])?,
        soft_blocks: parse_field(fields[2])?,
        hard_blocks: parse_field(fields[3])?,
        used_files: parse_field(fields[5])?,
        soft_files: parse_field(fields[6])?,
        hard_files: parse_field(fields[7])?,
    })
}

/// Read the current quota record for a user, if quotas are active
pub fn get_quota(user: &str) -> Result<Option<QuotaRecord>> {
    let output = Exec::new("quota").args(["-pw", user]).output_string()?;
    Ok(parse_quota_output(&output))
}

/// Apply hard block/file limits for a user on the filesystem mounted at `mountpoint`
pub fn set_quota(user: &str, max_blocks: u64, max_files: u64, mountpoint: &Path) -> Result<()> {
    Exec::new("setquota")
        .args(["-u", user])
        .args([
            "0".to_string(),
            max_blocks.to_string(),
            "0".to_string(),
            max_files.to_string(),
        ])
        .path_arg(mountpoint)
        .silent_io()
        .run()
}

/// Mount point containing `path`: walk up parents until the device id changes
pub fn mountpoint(path: &Path) -> Result<PathBuf> {
    let mut current = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let dev = std::fs::symlink_metadata(&current)
        .map_err(|e| GearError::fs(&current, e))?
        .dev();

    while let Some(parent) = current.parent() {
        let parent_dev = std::fs::symlink_metadata(parent)
            .map_err(|e| GearError::fs(parent, e))?
            .dev();
        if parent_dev != dev {
            break;
        }
        current = parent.to_path_buf();
    }

    Ok(current)
}
