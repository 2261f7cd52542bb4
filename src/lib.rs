//! gearbox: per-node agent managing gears and their addons
//!
//! A gear is an isolated unit on a shared host: a dedicated account, a home
//! directory, resource limits and a security label. Addons are installable
//! components (framework runtimes, databases) living in the gear home.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: Resource isolation units (v1/v2 backends, freezer, restore)
//! - [`kernel::selinux`]: MCS label derivation and file labelling
//! - [`kernel::quota`]: Disk quota inspection and `setquota`
//! - [`kernel::pam`]: Per-gear PAM limits files
//! - [`kernel::traffic`]: Per-uid traffic shaping classes
//! - [`kernel::account`]: Gear accounts and home skeleton
//! - [`kernel::signal`]: Process termination helpers
//!
//! ## Gears ([`gear`])
//! - [`gear::plugin`]: OS capability interface selected at startup
//! - [`gear::linux`]: Linux lifecycle with rollback and freeze/kill convergence
//! - [`gear::environ`]: File-per-variable environment store
//!
//! ## Addons ([`addon`])
//! - [`addon::control`]: Install, remove, destroy and control actions
//! - [`addon::endpoint`]: Private IP/port allocation
//! - [`addon::locking`]: Locked-file resolution and post-action validation
//! - [`addon::files`], [`addon::template`], [`addon::repository`]
//!
//! ## Supporting modules
//! - [`proxy`]: Front-end proxy mappings
//! - [`exec`]: External command builder
//! - [`safety`]: Best-effort cleanup and per-gear locks
//! - [`config`]: Node settings, capacity profile, error taxonomy
//! - [`testing`]: In-memory doubles for the addon collaborators

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Gears and addons
pub mod addon;
pub mod gear;

// Front-end proxy
pub mod proxy;

// Safety & Cleanup
pub mod safety;

// Configuration & Errors
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint for the gearctl binary
pub mod cli;

pub use config::types::{GearError, Result};
