//! Front-end proxy registration.
//!
//! A framework addon publishes `frontend path -> backend URL` mappings for
//! its gear. Keys are the gear id followed by the frontend path; only
//! backends using a supported protocol are registered.

pub mod db;

use crate::addon::template::expand_placeholders;
use crate::config::types::Result;
use crate::gear::Gear;
use std::collections::BTreeMap;

pub use db::FileProxyRegistry;

pub const SUPPORTED_PROTOCOLS: [&str; 7] = ["http", "https", "ajp", "fcgi", "scgi", "ws", "wss"];

pub trait ProxyRegistry {
    /// Register the gear's domain and insert missing mappings
    fn add_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()>;
    fn remove_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()>;
    /// Drop the domain entry and every mapping owned by the gear
    fn purge(&self, gear: &Gear) -> Result<()>;
}

/// Scheme of a backend URL
pub fn protocol(backend: &str) -> Option<&str> {
    backend.split_once("://").map(|(scheme, _)| scheme)
}

pub fn is_supported(backend: &str) -> bool {
    protocol(backend).map_or(false, |p| SUPPORTED_PROTOCOLS.contains(&p))
}

/// Frontends are absolute paths, so a key never reads as another gear's
pub fn is_valid_frontend(frontend: &str) -> bool {
    frontend.starts_with('/')
}

pub fn mapping_key(gear_id: &str, frontend: &str) -> String {
    format!("{}{}", gear_id, frontend)
}

/// Expand `${NAME}` references in backends against the gear environment
/// and drop unsupported protocols
pub fn resolve_mappings(
    mappings: &BTreeMap<String, String>,
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    mappings
        .iter()
        .map(|(frontend, backend)| {
            (frontend.clone(), expand_placeholders(backend, |name| env.get(name).cloned()))
        })
        .filter(|(frontend, backend)| {
            let supported = is_supported(backend);
            if !supported {
                log::warn!("Ignoring proxy mapping {} -> {}: unsupported protocol", frontend, backend);
            }
            supported
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocols() {
        assert_eq!(protocol("fcgi://127.0.0.1:9000"), Some("fcgi"));
        assert_eq!(protocol("127.0.0.1:9000"), None);
        assert!(is_supported("wss://x"));
        assert!(!is_supported("ftp://x"));
    }

    #[test]
    fn test_resolve_mappings() {
        let mappings: BTreeMap<String, String> = [
            ("/".to_string(), "http://${PHP_IP}:${PHP_PORT}".to_string()),
            ("/ftp".to_string(), "ftp://${PHP_IP}".to_string()),
        ]
        .into_iter()
        .collect();
        let env: BTreeMap<String, String> = [
            ("PHP_IP".to_string(), "127.0.125.1".to_string()),
            ("PHP_PORT".to_string(), "8080".to_string()),
        ]
        .into_iter()
        .collect();

        let resolved = resolve_mappings(&mappings, &env);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["/"], "http://127.0.125.1:8080");
        assert_eq!(mapping_key("g1", "/"), "g1/");
    }

    #[test]
    fn test_frontend_must_be_absolute() {
        assert!(is_valid_frontend("/"));
        assert!(is_valid_frontend("/api"));
        assert!(!is_valid_frontend("0/"));
        assert!(!is_valid_frontend(""));
    }
}
