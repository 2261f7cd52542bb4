//! Addon lifecycle of one gear: install, remove, destroy and control
//! actions.
//!
//! Install runs linearly (place files, seed environment, allocate endpoints,
//! run `setup` unlocked under validation, lock, populate the repository and
//! register proxy mappings for a framework) and deletes the half-installed
//! directory on any failure. Remove and destroy always complete.

use super::endpoint::{AddressProbe, EndpointAllocator};
use super::registry::AddonRegistry;
use super::repository::{Repository, RepositoryFactory, GitRepositoryFactory, EMPTY_REPOSITORY};
use super::template::{self, PlaceholderRenderer, TemplateRenderer};
use super::{files, locking, Addon, ADDON_NAME_RE, BIN_DIR, ENV_DIR};
use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use crate::gear::{environ, ContainerPlugin, Gear};
use crate::proxy::{self, ProxyRegistry};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Gear variables naming the installed framework
pub const FRAMEWORK_VARS: [&str; 2] = ["FRAMEWORK", "FRAMEWORK_DIR"];

type Env = BTreeMap<String, String>;

pub struct AddonControl<'a> {
    plugin: &'a dyn ContainerPlugin,
    registry: AddonRegistry,
    proxy: &'a dyn ProxyRegistry,
    probe: &'a dyn AddressProbe,
    renderer: &'a dyn TemplateRenderer,
    repositories: &'a dyn RepositoryFactory,
    template_config: Env,
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl<'a> AddonControl<'a> {
    /// Open a session on the plugin's gear, scanning its installed addons
    pub fn new(
        plugin: &'a dyn ContainerPlugin,
        proxy: &'a dyn ProxyRegistry,
        probe: &'a dyn AddressProbe,
    ) -> Result<Self> {
        let registry = AddonRegistry::scan(&plugin.gear().home)?;
        Ok(Self {
            plugin,
            registry,
            proxy,
            probe,
            renderer: &PlaceholderRenderer,
            repositories: &GitRepositoryFactory,
            template_config: Env::new(),
        })
    }

    pub fn with_renderer(mut self, renderer: &'a dyn TemplateRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_repositories(mut self, repositories: &'a dyn RepositoryFactory) -> Self {
        self.repositories = repositories;
        self
    }

    /// Values exposed to templates as `config.*`
    pub fn with_template_config(mut self, config: Env) -> Self {
        self.template_config = config;
        self
    }

    fn gear(&self) -> &Gear {
        self.plugin.gear()
    }

    pub fn registry(&self) -> &AddonRegistry {
        &self.registry
    }

    /// Installed addons, valid or not, in name order
    pub fn addons(&self) -> impl Iterator<Item = &Addon> {
        self.registry.all()
    }

    /// Install an addon from a directory or an archive.
    ///
    /// `repo_url` only matters for a framework: none seeds the application
    /// repository from the addon template, `empty` creates an empty one and
    /// anything else is cloned.
    pub fn install(&mut self, source: &Path, repo_url: Option<&str>) -> Result<Addon> {
        let meta = std::fs::metadata(source)
            .map_err(|_| GearError::NotFound(format!("Invalid addon file: {}", source.display())))?;

        if meta.is_dir() {
            return self.install_from(source, true, repo_url);
        }

        let tmp_root = self.gear().tmp_dir();
        std::fs::create_dir_all(&tmp_root).map_err(|e| GearError::fs(&tmp_root, e))?;
        let tmp = tempfile::Builder::new()
            .prefix("tmp")
            .tempdir_in(&tmp_root)
            .map_err(|e| GearError::fs(&tmp_root, e))?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o750))
            .map_err(|e| GearError::fs(tmp.path(), e))?;

        files::extract_archive(source, tmp.path())?;
        // The extracted tree is moved into place; dropping `tmp` removes
        // whatever is left
        self.install_from(tmp.path(), false, repo_url)
    }

    fn install_from(&mut self, source: &Path, copy: bool, repo_url: Option<&str>) -> Result<Addon> {
        let addon = Addon::load_valid(source)?;
        let target = self.gear().addon_dir(&addon.name);

        if self.registry.contains(&addon.name) || std::fs::symlink_metadata(&target).is_ok() {
            return Err(GearError::Conflict(format!("Addon already installed: {}", addon.name)));
        }
        if addon.is_framework() && self.registry.framework().is_some() {
            return Err(GearError::Conflict("A framework addon already installed".to_string()));
        }

        let addon = addon.with_path(target);
        info!("Installing addon {} into gear {}", addon.name, self.gear().id);

        let result = self
            .place(source, &addon.path, copy)
            .and_then(|()| self.configure(&addon, repo_url));
        match result {
            Ok(()) => {
                self.registry.insert(addon.clone());
                info!("Installed addon {}", addon.name);
                Ok(addon)
            }
            Err(e) => {
                warn!("Install of {} failed: {}", addon.name, e);
                self.rollback(&addon);
                Err(e)
            }
        }
    }

    fn place(&self, source: &Path, target: &Path, copy: bool) -> Result<()> {
        if copy {
            files::copy_addon(source, target)
        } else {
            std::fs::rename(source, target).map_err(|e| GearError::fs(target, e))
        }
    }

    fn configure(&self, addon: &Addon, repo_url: Option<&str>) -> Result<()> {
        let gear = self.gear();
        let target = &addon.path;
        files::set_tree(self.plugin, target, false)?;

        let dir_var = format!("{}_DIR", addon.env_name());
        environ::add(&addon.env_dir(), &dir_var, &target.to_string_lossy(), false)?;
        if addon.is_framework() {
            environ::add(&gear.env_dir(), FRAMEWORK_VARS[0], &addon.name, false)?;
            environ::add(&gear.env_dir(), FRAMEWORK_VARS[1], &target.to_string_lossy(), false)?;
        }

        EndpointAllocator::new(gear, self.probe).allocate(addon, &self.registry)?;

        locking::validate(gear, target, || {
            locking::with_unlocked(self.plugin, target, true, || {
                let env = environ::load_for_addon(gear, target)?;
                template::process_templates(self.renderer, target, &env, &self.template_config)?;
                self.run_action(target, &env, "setup", &[])
            })
        })?;

        for dir in [addon.metadata_dir(), addon.bin_dir(), addon.env_dir()] {
            files::set_tree(self.plugin, &dir, true)?;
        }

        if addon.is_framework() {
            let repo = self.repositories.open(self.plugin);
            let existed = repo.exists();
            let result = self
                .populate_repository(repo.as_ref(), addon, repo_url)
                .and_then(|()| self.register_proxy(addon));
            if result.is_err() && !existed {
                if let Err(e) = repo.destroy() {
                    warn!("Failed to destroy repository of {}: {}", gear.id, e);
                }
            }
            result?;
        }
        Ok(())
    }

    fn rollback(&self, addon: &Addon) {
        if let Err(e) = files::remove_tree(&addon.path) {
            warn!("Failed to remove {}: {}", addon.path.display(), e);
        }
        if addon.is_framework() {
            self.clear_framework_vars();
        }
    }

    fn clear_framework_vars(&self) {
        let env_dir = self.gear().env_dir();
        for key in FRAMEWORK_VARS {
            if let Err(e) = environ::remove(&env_dir, key) {
                warn!("Failed to remove {}: {}", key, e);
            }
        }
    }

    fn populate_repository(&self, repo: &dyn Repository, addon: &Addon, url: Option<&str>) -> Result<()> {
        match url {
            None | Some("") => repo.populate_from_template(&addon.path)?,
            Some(EMPTY_REPOSITORY) => repo.populate_empty()?,
            Some(url) => repo.populate_from_url(url)?,
        }
        if repo.exists() {
            repo.checkout(&self.gear().app_dir())?;
        }
        Ok(())
    }

    fn register_proxy(&self, addon: &Addon) -> Result<()> {
        if addon.proxy_mappings.is_empty() {
            return Ok(());
        }
        let env = environ::load_all(self.gear())?;
        let mappings = proxy::resolve_mappings(&addon.proxy_mappings, &env);
        self.proxy.add_mappings(self.gear(), &mappings)
    }

    /// Remove an installed addon. The directory is deleted even when
    /// stopping or tearing the addon down fails.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !ADDON_NAME_RE.is_match(name) {
            return Err(GearError::Config(format!("Invalid addon name '{}'", name)));
        }
        let path = self.gear().addon_dir(name);
        let registered = self.registry.remove(name);
        if std::fs::symlink_metadata(&path).is_err() {
            debug!("Addon {} is not installed", name);
            return Ok(());
        }
        let addon = registered.unwrap_or_else(|| Addon::load(&path));
        info!("Removing addon {} from gear {}", name, self.gear().id);

        let result = if addon.valid { self.teardown(&addon) } else { Ok(()) };

        if addon.valid {
            if let Err(e) = self.proxy.remove_mappings(self.gear(), &addon.proxy_mappings) {
                warn!("Failed to remove proxy mappings of {}: {}", name, e);
            }
        }
        if addon.is_framework() {
            self.clear_framework_vars();
        }
        let removed = files::remove_tree(&path);
        result.and(removed)
    }

    fn teardown(&self, addon: &Addon) -> Result<()> {
        let env = environ::load_all(self.gear())?;
        EndpointAllocator::new(self.gear(), self.probe).deallocate(addon);
        self.do_control(&addon.path, &env, "stop", true)?;
        locking::with_unlocked(self.plugin, &addon.path, false, || {
            self.run_action(&addon.path, &env, "teardown", &[])
        })
    }

    /// Tear every valid addon down and purge the gear's proxy
    /// registrations; failures are logged only
    pub fn destroy(&self) {
        let env = environ::load_all(self.gear()).unwrap_or_else(|e| {
            warn!("Failed to load environment of {}: {}", self.gear().id, e);
            Env::new()
        });
        for addon in self.registry.valid() {
            let result = locking::with_unlocked(self.plugin, &addon.path, false, || {
                self.run_action(&addon.path, &env, "teardown", &[])
            });
            if let Err(e) = result {
                warn!("Teardown of {} failed: {}", addon.name, e);
            }
        }
        if let Err(e) = self.proxy.purge(self.gear()) {
            warn!("Failed to purge proxy registrations of {}: {}", self.gear().id, e);
        }
    }

    pub fn start(&self) -> Result<()> {
        self.control_all("start", true)
    }

    pub fn stop(&self) -> Result<()> {
        self.control_all("stop", true)
    }

    pub fn tidy(&self) -> Result<()> {
        self.control_all("tidy", false)?;
        self.repositories.open(self.plugin).tidy()
    }

    fn control_all(&self, action: &str, hooks: bool) -> Result<()> {
        let env = environ::load_all(self.gear())?;
        for addon in self.registry.valid() {
            self.do_control(&addon.path, &env, action, hooks)?;
        }
        Ok(())
    }

    fn do_control(&self, path: &Path, env: &Env, action: &str, hooks: bool) -> Result<()> {
        if hooks {
            self.run_hook(&format!("pre_{}", action), env)?;
        }
        self.run_action(path, env, "control", &[action])?;
        if hooks {
            self.run_hook(&format!("post_{}", action), env)?;
        }
        Ok(())
    }

    /// Run `bin/<action>` of the addon at `path` as the gear, if executable
    fn run_action(&self, path: &Path, env: &Env, action: &str, args: &[&str]) -> Result<()> {
        let executable = path.join(BIN_DIR).join(action);
        if !is_executable(&executable) {
            debug!("Skipping {}: not executable", executable.display());
            return Ok(());
        }

        let mut env = env.clone();
        env.extend(environ::load(&path.join(ENV_DIR))?);
        let exec = Exec::program_path(&executable)
            .args(args.iter().copied())
            .directory(path)
            .environment(env);
        self.plugin.join(exec)?.run()
    }

    fn run_hook(&self, name: &str, env: &Env) -> Result<()> {
        let hook = self.gear().hooks_dir().join(name);
        if !is_executable(&hook) {
            return Ok(());
        }
        let exec = Exec::program_path(&hook).environment(env.clone());
        self.plugin.join(exec)?.run()
    }
}
