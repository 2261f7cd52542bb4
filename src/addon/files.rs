//! Addon file placement: tree copies with shared symlinks, archive
//! extraction, ownership toggling and removal.

use super::{METADATA_DIR, SHARED_FILES, SHARE_DIR};
use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use crate::gear::ContainerPlugin;
use glob::{MatchOptions, Pattern};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Shared-file patterns of an addon source.
///
/// `metadata/shared_files` lists one glob per line; without it a `share/`
/// directory is shared as a whole.
pub fn shared_patterns(source: &Path) -> Result<Vec<Pattern>> {
    let manifest = source.join(METADATA_DIR).join(SHARED_FILES);
    let lines: Vec<String> = if manifest.exists() {
        fs::read_to_string(&manifest)
            .map_err(|e| GearError::fs(&manifest, e))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    } else if source.join(SHARE_DIR).exists() {
        vec![SHARE_DIR.to_string()]
    } else {
        Vec::new()
    };

    lines
        .iter()
        .map(|l| {
            Pattern::new(l).map_err(|e| {
                GearError::Config(format!("Invalid shared file pattern '{}': {}", l, e))
            })
        })
        .collect()
}

fn copy_entry(src: &Path, dst: &Path, file_type: fs::FileType) -> Result<()> {
    if file_type.is_symlink() {
        let link = fs::read_link(src).map_err(|e| GearError::fs(src, e))?;
        symlink(&link, dst).map_err(|e| GearError::fs(dst, e))?;
    } else if file_type.is_dir() {
        fs::create_dir(dst).map_err(|e| GearError::fs(dst, e))?;
        let perms = fs::metadata(src).map_err(|e| GearError::fs(src, e))?.permissions();
        fs::set_permissions(dst, perms).map_err(|e| GearError::fs(dst, e))?;
    } else {
        // fs::copy carries the permission bits over
        fs::copy(src, dst).map_err(|e| GearError::fs(dst, e))?;
    }
    Ok(())
}

/// Copy an addon source tree to `target`, symlinking shared paths back to
/// the source instead of copying them
pub fn copy_addon(source: &Path, target: &Path) -> Result<()> {
    let source = fs::canonicalize(source).map_err(|e| GearError::fs(source, e))?;
    let patterns = shared_patterns(&source)?;
    copy_entry(&source, target, fs::metadata(&source).map_err(|e| GearError::fs(&source, e))?.file_type())?;

    let mut walker = WalkDir::new(&source).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| GearError::Filesystem(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(&source)
            .map_err(|e| GearError::Filesystem(e.to_string()))?;
        let dst = target.join(rel);

        if patterns.iter().any(|p| p.matches_path_with(rel, MATCH_OPTIONS)) {
            symlink(entry.path(), &dst).map_err(|e| GearError::fs(&dst, e))?;
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        copy_entry(entry.path(), &dst, entry.file_type())?;
    }

    log::debug!("Copied addon {} -> {}", source.display(), target.display());
    Ok(())
}

/// Command extracting `archive` into `dest`, chosen by extension
pub fn extract_command(archive: &Path, dest: &Path) -> Result<Exec> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let exec = if name.ends_with(".zip") {
        Exec::new("unzip").arg("-d").path_arg(dest).path_arg(archive)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Exec::new("tar").arg("-C").path_arg(dest).arg("-xzpf").path_arg(archive)
    } else if name.ends_with(".tar") {
        Exec::new("tar").arg("-C").path_arg(dest).arg("-xpf").path_arg(archive)
    } else {
        return Err(GearError::NotFound(format!(
            "Unsupported addon archive file: {}",
            archive.display()
        )));
    };
    Ok(exec.silent_io())
}

pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    extract_command(archive, dest)?.run()
}

/// Apply read-only or read-write ownership to every entry under `root`.
/// A missing root is skipped.
pub fn set_tree(plugin: &dyn ContainerPlugin, root: &Path, read_only: bool) -> Result<()> {
    if fs::symlink_metadata(root).is_err() {
        return Ok(());
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| GearError::Filesystem(e.to_string()))?;
        if read_only {
            plugin.set_file_read_only(entry.path())?;
        } else {
            plugin.set_file_read_write(entry.path())?;
        }
    }
    Ok(())
}

/// Delete a tree without following symlinks; absence is not an error
pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GearError::fs(path, e)),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(|e| GearError::fs(path, e)),
        Ok(_) => fs::remove_file(path).map_err(|e| GearError::fs(path, e)),
    }
}
