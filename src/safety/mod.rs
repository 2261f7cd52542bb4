//! Safety and cleanup
//!
//! Best-effort cleanup with per-step isolation, and per-gear serialization.

pub mod cleanup;
pub mod gear_lock;
