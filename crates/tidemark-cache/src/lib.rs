//! Content-addressed, disk-persisted memoization of expensive fetch calls.
//!
//! Layout: one sub-directory per logical operation, one file per canonical
//! argument digest. The payload is the serialized result with no embedded
//! metadata; the file's own modification time is the freshness signal,
//! interpreted against the source's publish schedule.
//!
//! Failure posture: a cache miss is always safe to recover from by
//! refetching, so every read error (missing file, corrupt payload) is a
//! miss, never an error. Writes go through a temp file and an atomic
//! rename so concurrent readers cannot observe a partial payload.

mod key;

pub use key::CacheKey;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use tidemark_core::PublishSchedule;

pub struct DataCache {
    root: PathBuf,
}

/// Per-operation entry counts and byte totals.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub operations: BTreeMap<String, OpStats>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct OpStats {
    pub entries: u64,
    pub bytes: u64,
}

impl DataCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating cache root at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.operation()).join(key.digest())
    }

    /// Raw payload lookup. Any I/O error is a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(key = %key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Deserialized payload lookup. Corrupt entries are a miss; they will
    /// be overwritten by the next successful fetch.
    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %key, error = %err, "corrupt cache entry; treating as miss");
                None
            }
        }
    }

    /// Atomic overwrite: write to a temp file in the entry's directory,
    /// then rename over the target.
    pub fn put(&self, key: &CacheKey, payload: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        let dir = path.parent().expect("entry path has parent");
        fs::create_dir_all(dir)
            .with_context(|| format!("creating cache dir at {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        tmp.write_all(payload).context("writing cache payload")?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("persisting cache entry at {}", path.display()))?;
        debug!(key = %key, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    pub fn put_json<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("serializing cache payload")?;
        self.put(key, &bytes)
    }

    /// When the entry was last written (file mtime, local wall clock), or
    /// `None` when absent.
    pub fn stored_at(&self, key: &CacheKey) -> Option<NaiveDateTime> {
        let meta = fs::metadata(self.entry_path(key)).ok()?;
        let modified = meta.modified().ok()?;
        Some(DateTime::<Local>::from(modified).naive_local())
    }

    /// Whether the entry is missing or the source has published since it
    /// was written. Expiration is the next scheduled publish instant after
    /// the write, not a fixed TTL.
    pub fn is_expired(&self, key: &CacheKey, now: NaiveDateTime, schedule: &PublishSchedule) -> bool {
        let Some(stored) = self.stored_at(key) else {
            return true;
        };
        match schedule.next_publish_after(stored) {
            None => false, // static sources never republish
            Some(next) => now >= next,
        }
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(err) => return Err(err).context("reading cache root"),
        };
        for op_dir in entries.flatten() {
            if !op_dir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let op = op_dir.file_name().to_string_lossy().into_owned();
            let mut op_stats = OpStats::default();
            for file in fs::read_dir(op_dir.path())?.flatten() {
                if let Ok(meta) = file.metadata() {
                    if meta.is_file() {
                        op_stats.entries += 1;
                        op_stats.bytes += meta.len();
                    }
                }
            }
            stats.operations.insert(op, op_stats);
        }
        Ok(stats)
    }

    /// Drop every entry for one operation.
    pub fn clear_operation(&self, operation: &str) -> Result<()> {
        let dir = self.root.join(operation);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("clearing cache op at {}", dir.display()))
            }
        }
    }

    /// Drop the whole cache (external housekeeping hook).
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("clearing cache root"),
        }
        fs::create_dir_all(&self.root).context("recreating cache root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;
    use tidemark_core::Periodicity;

    fn cache() -> (TempDir, DataCache) {
        let dir = TempDir::new().unwrap();
        let cache = DataCache::open(dir.path().join("webcache")).unwrap();
        (dir, cache)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("fetch").arg("series", "quotes");
        assert!(cache.get(&key).is_none());
        cache.put_json(&key, &vec!["row1", "row2"]).unwrap();
        let rows: Vec<String> = cache.get_json(&key).unwrap();
        assert_eq!(rows, vec!["row1", "row2"]);
    }

    #[test]
    fn entries_live_under_operation_subdir() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("list_codes").arg("market", "sz");
        cache.put(&key, b"payload").unwrap();
        let path = cache.root().join("list_codes").join(key.digest());
        assert!(path.is_file());
        // No temp droppings next to the entry.
        let count = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn overwrite_replaces_payload() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("fetch").arg("series", "quotes");
        cache.put(&key, b"old").unwrap();
        cache.put(&key, b"new").unwrap();
        assert_eq!(cache.get(&key).unwrap(), b"new");
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("fetch").arg("series", "quotes");
        cache.put(&key, b"{not json").unwrap();
        let decoded: Option<Vec<String>> = cache.get_json(&key);
        assert!(decoded.is_none());
        // The raw payload is still readable; only decoding failed.
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn missing_entry_is_expired() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("fetch").arg("series", "quotes");
        let now = Local::now().naive_local();
        assert!(cache.is_expired(&key, now, &PublishSchedule::daily()));
    }

    #[test]
    fn expiry_crosses_the_next_publish_instant() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("fetch").arg("series", "quotes");
        cache.put(&key, b"rows").unwrap();
        let stored = cache.stored_at(&key).unwrap();
        let schedule = PublishSchedule::daily();
        let next = schedule.next_publish_after(stored).unwrap();

        assert!(!cache.is_expired(&key, stored + Duration::seconds(1), &schedule));
        assert!(!cache.is_expired(&key, next - Duration::seconds(1), &schedule));
        assert!(cache.is_expired(&key, next, &schedule));
        assert!(cache.is_expired(&key, next + Duration::hours(1), &schedule));
    }

    #[test]
    fn static_entries_never_expire() {
        let (_dir, cache) = cache();
        let key = CacheKey::new("classification").arg("tree", "csrc");
        cache.put(&key, b"rows").unwrap();
        let schedule = PublishSchedule::new(
            Periodicity::Static,
            chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        );
        let far_future = Local::now().naive_local() + Duration::days(365 * 10);
        assert!(!cache.is_expired(&key, far_future, &schedule));
    }

    #[test]
    fn stats_and_clear() {
        let (_dir, cache) = cache();
        cache.put(&CacheKey::new("a").arg("x", 1), b"12345").unwrap();
        cache.put(&CacheKey::new("a").arg("x", 2), b"12345").unwrap();
        cache.put(&CacheKey::new("b").arg("x", 1), b"1").unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.operations["a"].entries, 2);
        assert_eq!(stats.operations["a"].bytes, 10);
        assert_eq!(stats.operations["b"].entries, 1);

        cache.clear_operation("a").unwrap();
        let stats = cache.stats().unwrap();
        assert!(!stats.operations.contains_key("a"));
        assert_eq!(stats.operations["b"].entries, 1);

        cache.clear().unwrap();
        assert!(cache.stats().unwrap().operations.is_empty());
    }
}
