//! Thin wrappers around Linux kernel primitives and host tools.
//!
//! Everything that touches the OS on behalf of a gear lives here.
//! Dependency direction: signal -> account -> quota/pam/traffic -> selinux -> cgroup

pub mod account;
pub mod cgroup;
pub mod pam;
pub mod quota;
pub mod selinux;
pub mod signal;
pub mod traffic;
