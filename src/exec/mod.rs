//! Execution control
//!
//! Synchronous external command execution shared by every lifecycle step.

pub mod command;

pub use command::{shell_join, Exec};
