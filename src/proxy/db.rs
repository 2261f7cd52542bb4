//! File-backed proxy databases.
//!
//! Each database is a JSON object in `<proxy_dir>/<name>.json`. Readers and
//! writers serialize on a `flock` of `<name>.lock`; updates are written to a
//! temporary file and renamed into place.

use super::{is_supported, is_valid_frontend, mapping_key, ProxyRegistry};
use crate::config::types::{GearError, Result};
use crate::gear::Gear;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const MAPPINGS_DB: &str = "mappings";
pub const CONTAINERS_DB: &str = "containers";

type Table = BTreeMap<String, String>;

/// Held `flock`, released when the file closes
struct DbLock {
    _file: File,
}

impl DbLock {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| GearError::Proxy(format!("Failed to open {}: {}", path.display(), e)))?;

        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: the fd is owned by `file`, which outlives this call.
        if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
            return Err(GearError::Proxy(format!(
                "flock {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { _file: file })
    }
}

/// One JSON key/value table
pub struct KeyValueDb {
    dir: PathBuf,
    name: &'static str,
}

impl KeyValueDb {
    pub fn new(dir: &Path, name: &'static str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name,
        }
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    fn lock(&self, exclusive: bool) -> Result<DbLock> {
        std::fs::create_dir_all(&self.dir).map_err(|e| GearError::fs(&self.dir, e))?;
        DbLock::acquire(&self.dir.join(format!("{}.lock", self.name)), exclusive)
    }

    fn load(&self) -> Result<Table> {
        let path = self.data_path();
        match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Ok(Table::new()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| GearError::Proxy(format!("Corrupt database {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
            Err(e) => Err(GearError::fs(&path, e)),
        }
    }

    fn store(&self, table: &Table) -> Result<()> {
        let path = self.data_path();
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| GearError::fs(&self.dir, e))?;
        serde_json::to_writer_pretty(&mut tmp, table)?;
        tmp.write_all(b"\n").map_err(|e| GearError::fs(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| GearError::fs(&path, e.error))?;
        Ok(())
    }

    pub fn read(&self) -> Result<Table> {
        let _lock = self.lock(false)?;
        self.load()
    }

    /// Apply `update` under the exclusive lock, storing the result only when
    /// it changed
    pub fn write<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Table),
    {
        let _lock = self.lock(true)?;
        let mut table = self.load()?;
        let before = table.clone();
        update(&mut table);
        if table != before {
            self.store(&table)?;
        }
        Ok(())
    }
}

pub struct FileProxyRegistry {
    mappings: KeyValueDb,
    containers: KeyValueDb,
}

impl FileProxyRegistry {
    pub fn new(dir: &Path) -> Self {
        Self {
            mappings: KeyValueDb::new(dir, MAPPINGS_DB),
            containers: KeyValueDb::new(dir, CONTAINERS_DB),
        }
    }

    pub fn mappings(&self) -> Result<Table> {
        self.mappings.read()
    }

    pub fn containers(&self) -> Result<Table> {
        self.containers.read()
    }

    /// Domain values hold `|`-separated gear ids
    fn add_container(&self, gear: &Gear) -> Result<()> {
        self.containers.write(|table| {
            let ids = table.entry(gear.domain.clone()).or_default();
            if ids.is_empty() {
                ids.push_str(&gear.id);
            } else if !ids.split('|').any(|id| id == gear.id) {
                ids.push('|');
                ids.push_str(&gear.id);
            }
        })
    }

    fn remove_container(&self, gear: &Gear) -> Result<()> {
        self.containers.write(|table| {
            let remaining = match table.get(&gear.domain) {
                Some(ids) => ids
                    .split('|')
                    .filter(|id| *id != gear.id)
                    .collect::<Vec<_>>()
                    .join("|"),
                None => return,
            };
            if remaining.is_empty() {
                table.remove(&gear.domain);
            } else {
                table.insert(gear.domain.clone(), remaining);
            }
        })
    }
}

/// Gear id part of a mapping key
fn key_owner(key: &str) -> &str {
    key.split_once('/').map_or(key, |(owner, _)| owner)
}

impl ProxyRegistry for FileProxyRegistry {
    fn add_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()> {
        self.add_container(gear)?;
        self.mappings.write(|table| {
            for (frontend, backend) in mappings.iter().filter(|(_, b)| is_supported(b)) {
                if !is_valid_frontend(frontend) {
                    log::warn!("Ignoring proxy mapping {} of {}: not an absolute path", frontend, gear.id);
                    continue;
                }
                table
                    .entry(mapping_key(&gear.id, frontend))
                    .or_insert_with(|| backend.clone());
            }
        })?;
        log::debug!("Registered {} proxy mappings for {}", mappings.len(), gear.id);
        Ok(())
    }

    fn remove_mappings(&self, gear: &Gear, mappings: &BTreeMap<String, String>) -> Result<()> {
        self.mappings.write(|table| {
            // Backends may be unexpanded here, so only the frontend counts
            for frontend in mappings.keys().filter(|f| is_valid_frontend(f)) {
                table.remove(&mapping_key(&gear.id, frontend));
            }
        })
    }

    fn purge(&self, gear: &Gear) -> Result<()> {
        self.remove_container(gear)?;
        self.mappings
            .write(|table| table.retain(|key, _| key_owner(key) != gear.id))?;
        log::debug!("Purged proxy registrations of {}", gear.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gear(id: &str, domain: &str) -> Gear {
        Gear::new(id, 1001, "small", domain, Path::new("/nonexistent"))
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_add_keeps_existing_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = FileProxyRegistry::new(dir.path());
        let g1 = gear("g1", "example.com");

        proxy
            .add_mappings(&g1, &map(&[("/", "http://127.0.0.1:8080"), ("/x", "gopher://h")]))
            .unwrap();
        proxy.add_mappings(&g1, &map(&[("/", "http://127.0.0.2:9090")])).unwrap();

        let mappings = proxy.mappings().unwrap();
        assert_eq!(mappings, map(&[("g1/", "http://127.0.0.1:8080")]));
        assert_eq!(proxy.containers().unwrap(), map(&[("example.com", "g1")]));
    }

    #[test]
    fn test_purge_only_touches_owner() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = FileProxyRegistry::new(dir.path());
        let g1 = gear("g1", "example.com");
        let g10 = gear("g10", "example.com");

        proxy.add_mappings(&g1, &map(&[("/", "http://a"), ("/api", "ws://b")])).unwrap();
        proxy.add_mappings(&g10, &map(&[("/", "http://c")])).unwrap();
        assert_eq!(proxy.containers().unwrap(), map(&[("example.com", "g1|g10")]));

        proxy.purge(&g1).unwrap();
        assert_eq!(proxy.mappings().unwrap(), map(&[("g10/", "http://c")]));
        assert_eq!(proxy.containers().unwrap(), map(&[("example.com", "g10")]));

        proxy.purge(&g10).unwrap();
        assert!(proxy.containers().unwrap().is_empty());
        proxy.purge(&g10).unwrap();
    }

    #[test]
    fn test_remove_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = FileProxyRegistry::new(dir.path());
        let g1 = gear("g1", "example.com");
        let php = map(&[("/", "fcgi://127.0.0.1:9000")]);

        proxy.add_mappings(&g1, &php).unwrap();
        proxy.remove_mappings(&g1, &php).unwrap();
        assert!(proxy.mappings().unwrap().is_empty());
        assert_eq!(key_owner("g1/api/v1"), "g1");
        assert_eq!(key_owner("g1"), "g1");
    }

    #[test]
    fn test_remove_mappings_with_unexpanded_backend() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = FileProxyRegistry::new(dir.path());
        let g1 = gear("g1", "example.com");

        proxy.add_mappings(&g1, &map(&[("/", "https://127.0.0.1:8443")])).unwrap();
        proxy.remove_mappings(&g1, &map(&[("/", "${SCHEME}://${PHP_IP}:8443")])).unwrap();
        assert!(proxy.mappings().unwrap().is_empty());
    }

    #[test]
    fn test_relative_frontend_cannot_claim_another_gear() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = FileProxyRegistry::new(dir.path());
        let g1 = gear("g1", "one.example.com");
        let g10 = gear("g10", "ten.example.com");

        proxy.add_mappings(&g1, &map(&[("0/", "http://127.0.0.1:1")])).unwrap();
        proxy.add_mappings(&g10, &map(&[("/", "http://127.0.0.2:2")])).unwrap();
        assert_eq!(proxy.mappings().unwrap(), map(&[("g10/", "http://127.0.0.2:2")]));

        proxy.purge(&g1).unwrap();
        assert_eq!(proxy.mappings().unwrap(), map(&[("g10/", "http://127.0.0.2:2")]));
    }
}
