//! Application source repository of a gear.
//!
//! Only framework addons populate it: from the addon's `template/`
//! directory, from a remote URL, or empty. A populated repository is checked
//! out into `<home>/app`.

use super::TEMPLATE_DIR;
use crate::addon::files;
use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use crate::gear::{ContainerPlugin, Gear};
use std::path::{Path, PathBuf};

/// Directory under the gear home holding bare repositories
pub const GIT_DIR: &str = "git";
/// Marker URL requesting an empty repository
pub const EMPTY_REPOSITORY: &str = "empty";

const COMMIT_IDENTITY: [&str; 4] = ["-c", "user.name=gearbox", "-c", "user.email=gearbox@localhost"];

pub trait Repository {
    fn exists(&self) -> bool;
    /// Seed from the `template/` directory of the addon at `addon_dir`
    fn populate_from_template(&self, addon_dir: &Path) -> Result<()>;
    fn populate_from_url(&self, url: &str) -> Result<()>;
    fn populate_empty(&self) -> Result<()>;
    fn checkout(&self, target: &Path) -> Result<()>;
    fn tidy(&self) -> Result<()>;
    fn destroy(&self) -> Result<()>;
}

/// Repository creation for a gear, replaceable in tests
pub trait RepositoryFactory {
    fn open<'a>(&self, plugin: &'a dyn ContainerPlugin) -> Box<dyn Repository + 'a>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GitRepositoryFactory;

impl RepositoryFactory for GitRepositoryFactory {
    fn open<'a>(&self, plugin: &'a dyn ContainerPlugin) -> Box<dyn Repository + 'a> {
        Box::new(GitRepository::new(plugin))
    }
}

/// Bare git repository at `<home>/git/<id>.git`
pub struct GitRepository<'a> {
    plugin: &'a dyn ContainerPlugin,
    path: PathBuf,
}

impl<'a> GitRepository<'a> {
    pub fn new(plugin: &'a dyn ContainerPlugin) -> Self {
        let path = repository_path(plugin.gear());
        Self { plugin, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self) -> Exec {
        Exec::new("git").arg("--git-dir").path_arg(&self.path)
    }

    fn prepare(&self) -> Result<()> {
        if self.exists() {
            return Err(GearError::Conflict(format!(
                "Repository already exists: {}",
                self.path.display()
            )));
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GearError::fs(parent, e))?;
        }
        Ok(())
    }

    /// Hand the repository over to the gear
    fn finish(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            self.plugin.set_file_read_write(parent)?;
        }
        files::set_tree(self.plugin, &self.path, false)
    }
}

pub fn repository_path(gear: &Gear) -> PathBuf {
    gear.home.join(GIT_DIR).join(format!("{}.git", gear.id))
}

pub fn init_command(path: &Path) -> Exec {
    Exec::new("git").arg("init").arg("--bare").arg("--quiet").path_arg(path)
}

pub fn clone_command(url: &str, path: &Path) -> Exec {
    Exec::new("git")
        .arg("clone")
        .arg("--bare")
        .arg("--no-hardlinks")
        .arg("--quiet")
        .arg(url)
        .path_arg(path)
}

impl Repository for GitRepository<'_> {
    fn exists(&self) -> bool {
        self.path.join("HEAD").is_file()
    }

    fn populate_from_template(&self, addon_dir: &Path) -> Result<()> {
        let template = addon_dir.join(TEMPLATE_DIR);
        if !template.is_dir() {
            log::debug!("No application template in {}", addon_dir.display());
            return Ok(());
        }
        self.prepare()?;
        init_command(&self.path).silent_io().run()?;
        self.git()
            .arg("--work-tree")
            .path_arg(&template)
            .args(["add", "--all", "."])
            .directory(&template)
            .silent_io()
            .run()?;
        self.git()
            .args(COMMIT_IDENTITY)
            .arg("--work-tree")
            .path_arg(&template)
            .args(["commit", "--quiet", "-m", "Creating template"])
            .directory(&template)
            .silent_io()
            .run()?;
        self.finish()
    }

    fn populate_from_url(&self, url: &str) -> Result<()> {
        self.prepare()?;
        clone_command(url, &self.path).silent_io().run()?;
        self.finish()
    }

    fn populate_empty(&self) -> Result<()> {
        self.prepare()?;
        init_command(&self.path).silent_io().run()?;
        self.finish()
    }

    fn checkout(&self, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target).map_err(|e| GearError::fs(target, e))?;
        let exec = self
            .git()
            .arg("--work-tree")
            .path_arg(target)
            .args(["checkout", "--force", "HEAD", "--", "."])
            .directory(target)
            .silent_io();
        self.plugin.join(exec)?.run()
    }

    fn tidy(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        let exec = self.git().args(["gc", "--quiet", "--auto"]).silent_io();
        self.plugin.join(exec)?.run()
    }

    fn destroy(&self) -> Result<()> {
        files::remove_tree(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_path() {
        let gear = Gear::new("g1", 1001, "small", "example.com", Path::new("/var/lib/gears/g1"));
        assert_eq!(repository_path(&gear), PathBuf::from("/var/lib/gears/g1/git/g1.git"));
    }

    #[test]
    fn test_commands() {
        let path = Path::new("/h/git/g1.git");
        assert_eq!(init_command(path).command(), &["git", "init", "--bare", "--quiet", "/h/git/g1.git"]);
        assert_eq!(
            clone_command("https://example.com/app.git", path).command(),
            &[
                "git",
                "clone",
                "--bare",
                "--no-hardlinks",
                "--quiet",
                "https://example.com/app.git",
                "/h/git/g1.git"
            ]
        );
    }
}
