//! `gearctl` command line.
//!
//! Commands are looked up in a static table carrying their arity; an unknown
//! command or wrong argument count prints usage and exits 1, a failing
//! handler prints `Command failure: ...` and exits 2.

use crate::addon::endpoint::TcpProbe;
use crate::addon::AddonControl;
use crate::config::profile::ResourceProfile;
use crate::config::settings::NodeConfig;
use crate::config::types::GearError;
use crate::gear::{select_plugin, validate_gear_id, ContainerPlugin, Gear, GearRecord};
use crate::gear::plugin::PluginServices;
use crate::kernel::cgroup::create_cgroup_backend;
use crate::kernel::selinux::SecurityLabeler;
use crate::proxy::FileProxyRegistry;
use crate::safety::gear_lock::acquire_gear_lock;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const EXIT_USAGE: i32 = 1;
pub const EXIT_FAILURE: i32 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Gear and addon lifecycle agent", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Debug logging and full error chains
    #[arg(short, long)]
    verbose: bool,
    /// Node configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Command to run (see `help`)
    command: Option<String>,
    /// Command arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

type Handler = fn(&Session, &[String]) -> Result<()>;

pub struct CommandSpec {
    pub name: &'static str,
    pub args: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub summary: &'static str,
    /// Serialize on the gear named by the first argument
    pub locks_gear: bool,
    handler: Handler,
}

pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        args: "",
        min_args: 0,
        max_args: 0,
        summary: "Show this message",
        locks_gear: false,
        handler: cmd_help,
    },
    CommandSpec {
        name: "create",
        args: "ID UID CAPACITY DOMAIN",
        min_args: 4,
        max_args: 4,
        summary: "Provision a gear",
        locks_gear: true,
        handler: cmd_create,
    },
    CommandSpec {
        name: "destroy",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "Tear a gear down",
        locks_gear: true,
        handler: cmd_destroy,
    },
    CommandSpec {
        name: "start",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "Restore runtime state and start every addon",
        locks_gear: true,
        handler: cmd_start,
    },
    CommandSpec {
        name: "stop",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "Stop every addon",
        locks_gear: true,
        handler: cmd_stop,
    },
    CommandSpec {
        name: "restart",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "Stop then start every addon",
        locks_gear: true,
        handler: cmd_restart,
    },
    CommandSpec {
        name: "tidy",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "Run the tidy action of every addon",
        locks_gear: true,
        handler: cmd_tidy,
    },
    CommandSpec {
        name: "install",
        args: "ID SOURCE [REPO]",
        min_args: 2,
        max_args: 3,
        summary: "Install an addon from a directory, archive or plugin name",
        locks_gear: true,
        handler: cmd_install,
    },
    CommandSpec {
        name: "remove",
        args: "ID ADDON",
        min_args: 2,
        max_args: 2,
        summary: "Remove an installed addon",
        locks_gear: true,
        handler: cmd_remove,
    },
    CommandSpec {
        name: "addons",
        args: "ID",
        min_args: 1,
        max_args: 1,
        summary: "List installed addons",
        locks_gear: false,
        handler: cmd_addons,
    },
];

pub fn find_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Look a command up and check its arity; the error is the usage text
pub fn resolve(name: &str, args: &[String]) -> std::result::Result<&'static CommandSpec, String> {
    let spec = find_command(name).ok_or_else(|| format!("Unknown command: {}\n\n{}", name, usage()))?;
    if args.len() < spec.min_args || args.len() > spec.max_args {
        return Err(format!("Usage: gearctl {} {}", spec.name, spec.args));
    }
    Ok(spec)
}

pub fn usage() -> String {
    let mut text = String::from("Usage: gearctl [-v] [--config PATH] COMMAND [ARGS...]\n\nCommands:\n");
    for spec in COMMANDS {
        let call = format!("{} {}", spec.name, spec.args);
        text.push_str(&format!("  {:<32} {}\n", call.trim_end(), spec.summary));
    }
    text
}

/// Addon source: a path when it contains `/`, else a plugin name
pub fn resolve_source(plugins_dir: &Path, source: &str) -> PathBuf {
    if source.contains('/') {
        PathBuf::from(source)
    } else {
        plugins_dir.join(source)
    }
}

/// Configuration and node services shared by the handlers of one run
pub struct Session {
    config: Arc<NodeConfig>,
}

impl Session {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn services(&self) -> Result<PluginServices> {
        let profile = ResourceProfile::load_from_file(&self.config.profile_path)
            .with_context(|| format!("loading {}", self.config.profile_path.display()))?;
        let cgroup = create_cgroup_backend(&self.config.cgroup)?;
        Ok(PluginServices {
            config: self.config.clone(),
            profile: Arc::new(profile),
            cgroup: Arc::from(cgroup),
            labeler: Arc::new(SecurityLabeler::new(&self.config.selinux)),
        })
    }

    fn load_gear(&self, id: &str) -> Result<Gear> {
        Ok(GearRecord::load(&self.config.gear_records_dir(), id)?.to_gear(&self.config))
    }

    fn plugin(&self, gear: Gear) -> Result<Box<dyn ContainerPlugin>> {
        Ok(select_plugin(&self.services()?, gear)?)
    }

    /// Run `action` against an addon session on the gear `id`
    fn with_addons<T>(&self, id: &str, action: impl FnOnce(&mut AddonControl<'_>) -> Result<T>) -> Result<T> {
        let plugin = self.plugin(self.load_gear(id)?)?;
        let proxy = FileProxyRegistry::new(&self.config.proxy_dir);
        let probe = TcpProbe::default();
        let mut control = AddonControl::new(plugin.as_ref(), &proxy, &probe)?
            .with_template_config(self.config.template.clone());
        action(&mut control)
    }
}

fn cmd_help(_session: &Session, _args: &[String]) -> Result<()> {
    print!("{}", usage());
    Ok(())
}

fn cmd_create(session: &Session, args: &[String]) -> Result<()> {
    let id = &args[0];
    validate_gear_id(id)?;
    let uid: u32 = args[1]
        .parse()
        .map_err(|_| GearError::Config(format!("Invalid uid '{}'", args[1])))?;

    let records = session.config.gear_records_dir();
    if GearRecord::load(&records, id).is_ok() {
        return Err(GearError::Conflict(format!("Gear {} already exists", id)).into());
    }

    let gear = Gear::new(id.as_str(), uid, args[2].as_str(), args[3].as_str(), session.config.gear_home(id));
    let plugin = session.plugin(gear.clone())?;
    plugin.create()?;
    if let Err(e) = GearRecord::from(&gear).save(&records) {
        let report = plugin.destroy();
        log::warn!("Rolled back gear {} ({} cleanup failures)", id, report.failures.len());
        return Err(e.into());
    }
    log::info!("Created gear {}", id);
    Ok(())
}

fn cmd_destroy(session: &Session, args: &[String]) -> Result<()> {
    let id = &args[0];
    let plugin = session.plugin(session.load_gear(id)?)?;

    let proxy = FileProxyRegistry::new(&session.config.proxy_dir);
    let probe = TcpProbe::default();
    match AddonControl::new(plugin.as_ref(), &proxy, &probe) {
        Ok(control) => control.destroy(),
        Err(e) => log::warn!("Skipping addon teardown of {}: {}", id, e),
    }

    let report = plugin.destroy();
    if !report.is_clean() {
        log::warn!("Gear {} destroyed with failed steps: {:?}", id, report.failed_steps());
    }
    if let Err(e) = GearRecord::remove(&session.config.gear_records_dir(), id) {
        log::warn!("Failed to remove record of {}: {}", id, e);
    }
    log::info!("Destroyed gear {}", id);
    Ok(())
}

fn cmd_start(session: &Session, args: &[String]) -> Result<()> {
    let id = &args[0];
    let plugin = session.plugin(session.load_gear(id)?)?;
    plugin.start()?;
    drop(plugin);
    session.with_addons(id, |control| Ok(control.start()?))
}

fn cmd_stop(session: &Session, args: &[String]) -> Result<()> {
    session.with_addons(&args[0], |control| Ok(control.stop()?))
}

fn cmd_restart(session: &Session, args: &[String]) -> Result<()> {
    session.with_addons(&args[0], |control| {
        control.stop()?;
        Ok(control.start()?)
    })
}

fn cmd_tidy(session: &Session, args: &[String]) -> Result<()> {
    session.with_addons(&args[0], |control| Ok(control.tidy()?))
}

fn cmd_install(session: &Session, args: &[String]) -> Result<()> {
    let source = resolve_source(&session.config.plugins_dir, &args[1]);
    let repo = args.get(2).map(String::as_str);
    let addon = session.with_addons(&args[0], |control| Ok(control.install(&source, repo)?))?;
    println!("{}", addon.name);
    Ok(())
}

fn cmd_remove(session: &Session, args: &[String]) -> Result<()> {
    session.with_addons(&args[0], |control| Ok(control.remove(&args[1])?))
}

fn cmd_addons(session: &Session, args: &[String]) -> Result<()> {
    session.with_addons(&args[0], |control| {
        for addon in control.addons() {
            let kind = if addon.is_framework() { "framework" } else { "plain" };
            let state = if addon.valid { "" } else { " (invalid)" };
            println!("{}\t{}{}", addon.name, kind, state);
        }
        Ok(())
    })
}

fn report_failure(err: &anyhow::Error, verbose: bool) {
    let message = err.to_string();
    if verbose || message.is_empty() {
        eprintln!("Command failure: {:?}", err);
    } else {
        eprintln!("Command failure: {:#}", err);
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let name = match cli.command.as_deref() {
        Some(name) => name,
        None => {
            eprint!("{}", usage());
            std::process::exit(EXIT_USAGE);
        }
    };
    let spec = match resolve(name, &cli.args) {
        Ok(spec) => spec,
        Err(text) => {
            eprintln!("{}", text);
            std::process::exit(EXIT_USAGE);
        }
    };

    let outcome = NodeConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow!(e))
        .and_then(|config| {
            let session = Session::new(config);
            let _lock = match (spec.locks_gear, cli.args.first()) {
                (true, Some(id)) => {
                    validate_gear_id(id)?;
                    Some(acquire_gear_lock(&session.config.run_dir, id)?)
                }
                _ => None,
            };
            (spec.handler)(&session, &cli.args)
        });

    if let Err(e) = outcome {
        report_failure(&e, cli.verbose);
        std::process::exit(EXIT_FAILURE);
    }
    Ok(())
}
