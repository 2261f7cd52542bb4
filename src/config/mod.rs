//! Configuration and error types
//!
//! Node settings, capacity tiers and the shared error taxonomy.

pub mod profile;
pub mod settings;
pub mod types;
