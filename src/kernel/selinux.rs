//! Mandatory access control labeling (SELinux MCS).
//!
//! Every gear gets a unique category set derived from its uid, so two gears
//! never share an MCS label. With the default group size of 2 the label is
//! `s<mls>:c<a>,c<b>`; larger groups enumerate K-combinations of the category set.

use crate::config::settings::{SelinuxSettings, MAX_MCS_SET_SIZE};
use crate::config::types::{GearError, Result};
use crate::exec::Exec;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Parameters of the MCS category allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McsParams {
    /// Number of categories (N)
    pub set_size: u32,
    /// Categories per label (K)
    pub group_size: u32,
    /// Uid mapped to the first label
    pub uid_offset: u32,
    pub mls_num: u32,
}

impl From<&SelinuxSettings> for McsParams {
    fn from(s: &SelinuxSettings) -> Self {
        Self {
            set_size: s.mcs_set_size,
            group_size: s.mcs_group_size,
            uid_offset: s.mcs_uid_offset,
            mls_num: s.mls_num,
        }
    }
}

/// Lexicographic K-combinations of `0..n`
pub struct Combinations {
    n: u32,
    current: Option<Vec<u32>>,
}

impl Combinations {
    pub fn new(n: u32, k: u32) -> Self {
        let current = if k <= n { Some((0..k).collect()) } else { None };
        Self { n, current }
    }
}

impl Iterator for Combinations {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Vec<u32>> {
        let result = self.current.take()?;
        let k = result.len();

        // Advance: rightmost position that can still move right
        let mut next = result.clone();
        let mut i = k;
        while i > 0 {
            i -= 1;
            if next[i] < self.n - (k - i) as u32 {
                next[i] += 1;
                for j in i + 1..k {
                    next[j] = next[j - 1] + 1;
                }
                self.current = Some(next);
                return Some(result);
            }
        }
        Some(result)
    }
}

fn binomial(n: u64, k: u64) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u64 = 1;
    for i in 0..k {
        acc = acc.saturating_mul(n - i) / (i + 1);
    }
    acc
}

/// Derive the MCS label for a uid
pub fn mcs_label_for(uid: u32, params: &McsParams) -> Result<String> {
    let n = params.set_size as u64;
    let k = params.group_size as u64;
    let uid = uid as u64;
    let offset = params.uid_offset as u64;

    if k == 0 || k > n || params.set_size > MAX_MCS_SET_SIZE {
        return Err(GearError::Config(format!(
            "Invalid MCS parameters: group size {} with set size {}",
            k, n
        )));
    }

    let min_uid = offset + k - 1;
    if uid < min_uid {
        return Err(GearError::OutOfRange(format!(
            "The UID must be at least {}",
            min_uid
        )));
    }

    if k == 2 {
        if uid >= offset + n * (n - 1) / 2 {
            return Err(GearError::OutOfRange(format!(
                "UID {} is too large for MCS set size {}",
                uid, n
            )));
        }

        // Closed form of the lexicographic enumeration for pairs
        let u = uid - offset;
        let b = 2 * n - 1;
        let disc = (b * b - 8 * (u - 1)) as f64;
        let root = ((b as f64 - disc.sqrt()) / 2.0).floor() as u64;
        let remainder = (u - (2 * n - root - 1) * root / 2) + root;
        return Ok(format!("s{}:c{},c{}", params.mls_num, root, remainder));
    }

    let index = uid - min_uid;
    if index >= binomial(n, k) {
        return Err(GearError::OutOfRange(format!(
            "UID {} is too large for MCS set size {} and group size {}",
            uid, n, k
        )));
    }

    let categories = Combinations::new(params.set_size, params.group_size)
        .nth(index as usize)
        .ok_or_else(|| GearError::OutOfRange(format!("No MCS combination for UID {}", uid)))?;

    let joined = categories
        .iter()
        .map(|c| format!("c{}", c))
        .collect::<Vec<_>>()
        .join(",");
    Ok(format!("s{}:{}", params.mls_num, joined))
}

/// True when SELinux is mounted and active on this host
pub fn detect_enabled() -> bool {
    Path::new("/sys/fs/selinux/enforce").exists()
}

/// Derives, caches, applies and queries security labels
pub struct SecurityLabeler {
    enabled: bool,
    params: McsParams,
    run_user: String,
    run_role: String,
    run_type: String,
    cache: Mutex<HashMap<u32, String>>,
}

impl SecurityLabeler {
    pub fn new(settings: &SelinuxSettings) -> Self {
        let enabled = settings.enabled.unwrap_or_else(detect_enabled);
        log::info!("SELinux labeling {}", if enabled { "enabled" } else { "disabled" });
        Self {
            enabled,
            params: McsParams::from(settings),
            run_user: settings.run_user.clone(),
            run_role: settings.run_role.clone(),
            run_type: settings.run_type.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// MCS label for a gear uid; `None` when labeling is off or for root
    pub fn label_for(&self, uid: u32) -> Result<Option<String>> {
        if !self.enabled || uid == 0 {
            return Ok(None);
        }

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| GearError::Config("label cache poisoned".to_string()))?;
        if let Some(label) = cache.get(&uid) {
            return Ok(Some(label.clone()));
        }
        let label = mcs_label_for(uid, &self.params)?;
        cache.insert(uid, label.clone());
        Ok(Some(label))
    }

    /// Full `user:role:type:level` context gear processes run under
    pub fn target_context(&self, uid: u32) -> Result<Option<String>> {
        Ok(self.label_for(uid)?.map(|label| {
            format!("{}:{}:{}:{}", self.run_user, self.run_role, self.run_type, label)
        }))
    }

    /// Set the MCS range of a file
    pub fn apply(&self, path: &Path, label: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        Exec::new("chcon")
            .args(["-h", "-l", label])
            .path_arg(path)
            .silent_io()
            .run()
    }

    /// Security context of the current process
    pub fn query(&self) -> Result<Option<String>> {
        if !self.enabled {
            return Ok(None);
        }
        let raw = std::fs::read_to_string("/proc/self/attr/current")?;
        Ok(Some(raw.trim_end_matches(['\0', '\n']).to_string()))
    }
}
