//! Capacity tiers: named sets of quota, cgroup and PAM limits.
//!
//! Loaded once at startup and shared read-only (`Arc<ResourceProfile>`).

use crate::config::types::{GearError, Result};
use crate::kernel::pam::PAM_LIMIT_NAMES;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default disk quota in 1K blocks (1GB)
pub const DEFAULT_QUOTA_BLOCKS: u64 = 1_048_576;
/// Default inode quota
pub const DEFAULT_QUOTA_FILES: u64 = 80_000;
/// Default ordering prefix of PAM limits files
pub const DEFAULT_LIMITS_ORDER: u32 = 85;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaLimits {
    pub blocks: u64,
    pub files: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            blocks: DEFAULT_QUOTA_BLOCKS,
            files: DEFAULT_QUOTA_FILES,
        }
    }
}

/// Limits of one capacity tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityTier {
    pub quota: QuotaLimits,
    /// Cgroup parameters keyed `<controller>.<parameter>`
    pub cgroup: BTreeMap<String, String>,
    /// PAM limits keyed by limit name (`nofile`, `nproc`, ...)
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceProfile {
    #[serde(default = "default_limits_order")]
    pub limits_order: u32,
    pub profiles: BTreeMap<String, CapacityTier>,
}

fn default_limits_order() -> u32 {
    DEFAULT_LIMITS_ORDER
}

impl ResourceProfile {
    pub fn from_json(content: &str) -> Result<Self> {
        let profile: ResourceProfile = serde_json::from_str(content)
            .map_err(|e| GearError::Config(format!("Failed to parse resource profile: {}", e)))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GearError::Config(format!(
                "Failed to read resource profile {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Look up a capacity tier by name
    pub fn tier(&self, name: &str) -> Result<&CapacityTier> {
        self.profiles
            .get(name)
            .ok_or_else(|| GearError::Config(format!("Unknown capacity profile: {}", name)))
    }

    fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            return Err(GearError::Config(
                "Resource profile defines no capacity tiers".to_string(),
            ));
        }

        for (name, tier) in &self.profiles {
            if tier.quota.blocks == 0 || tier.quota.files == 0 {
                return Err(GearError::Config(format!(
                    "Profile '{}': quota limits must be non-zero",
                    name
                )));
            }

            for (key, value) in &tier.limits {
                if !PAM_LIMIT_NAMES.contains(&key.as_str()) {
                    return Err(GearError::Config(format!(
                        "Profile '{}': unknown PAM limit '{}'",
                        name, key
                    )));
                }
                if value.trim().is_empty() || value.chars().any(char::is_whitespace) {
                    return Err(GearError::Config(format!(
                        "Profile '{}': invalid value {:?} for limit '{}'",
                        name, value, key
                    )));
                }
            }

            for (key, value) in &tier.cgroup {
                if !key.contains('.') || key.contains('/') {
                    return Err(GearError::Config(format!(
                        "Profile '{}': malformed cgroup parameter '{}'",
                        name, key
                    )));
                }
                if value.trim().is_empty() {
                    return Err(GearError::Config(format!(
                        "Profile '{}': empty value for cgroup parameter '{}'",
                        name, key
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "limits_order": 90,
        "profiles": {
            "small": {
                "quota": {"blocks": 2048, "files": 100},
                "cgroup": {"memory.limit_in_bytes": "536870912"},
                "limits": {"nofile": "4096", "nproc": "0"}
            },
            "medium": {}
        }
    }"#;

    #[test]
    fn test_parse_profile() {
        let profile = ResourceProfile::from_json(SAMPLE).unwrap();
        assert_eq!(profile.limits_order, 90);

        let small = profile.tier("small").unwrap();
        assert_eq!(small.quota.blocks, 2048);
        assert_eq!(small.limits.get("nofile").map(String::as_str), Some("4096"));

        let medium = profile.tier("medium").unwrap();
        assert_eq!(medium.quota, QuotaLimits::default());
        assert!(medium.cgroup.is_empty());
    }

    #[test]
    fn test_unknown_tier() {
        let profile = ResourceProfile::from_json(SAMPLE).unwrap();
        assert!(matches!(profile.tier("huge"), Err(GearError::Config(_))));
    }

    #[test]
    fn test_rejects_unknown_limit_name() {
        let json = r#"{"profiles": {"small": {"limits": {"bogus": "1"}}}}"#;
        assert!(matches!(ResourceProfile::from_json(json), Err(GearError::Config(_))));
    }

    #[test]
    fn test_rejects_malformed_cgroup_key() {
        let json = r#"{"profiles": {"small": {"cgroup": {"memory": "1"}}}}"#;
        assert!(matches!(ResourceProfile::from_json(json), Err(GearError::Config(_))));
    }

    #[test]
    fn test_default_order() {
        let profile = ResourceProfile::from_json(r#"{"profiles": {"small": {}}}"#).unwrap();
        assert_eq!(profile.limits_order, DEFAULT_LIMITS_ORDER);
    }
}
