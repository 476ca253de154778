//! # Seen Store
//! Persistent duplicate suppression shared by every feed source.
//!
//! Layout on disk is a JSON object `{bucket: {fingerprint: epoch_seconds}}`.
//! The whole map is rewritten on every mutation through a temp file + rename,
//! so a crash mid-write leaves the previous snapshot intact.
//!
//! - Missing or corrupt file → empty store (never fatal).
//! - Write failures are logged; memory stays authoritative and the next
//!   mutation retries the write.
//! - Age is only checked by `purge_old`, never on read.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use metrics::counter;
use tracing::{debug, warn};

type Buckets = BTreeMap<String, BTreeMap<String, i64>>;

pub const DEFAULT_TTL_DAYS: u64 = 7;

/// Build a fingerprint as `bucket|part1|part2...`.
pub fn fingerprint<S: AsRef<str>>(bucket: &str, parts: &[S]) -> String {
    let mut out = String::from(bucket);
    for p in parts {
        out.push('|');
        out.push_str(p.as_ref());
    }
    out
}

#[derive(Debug)]
pub struct SeenStore {
    path: PathBuf,
    ttl_secs: i64,
    data: Buckets,
    /// Last persist attempt failed; retry on the next mutation.
    dirty: bool,
    writes: u64,
}

impl SeenStore {
    /// Load the store from `path`. Never fails: unreadable data starts empty.
    pub fn open(path: impl Into<PathBuf>, ttl_days: u64) -> Self {
        let path = path.into();
        let data = load(&path);
        Self {
            path,
            ttl_secs: (ttl_days.saturating_mul(86_400)).min(i64::MAX as u64) as i64,
            data,
            dirty: false,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_seen(&self, bucket: &str, fingerprint: &str) -> bool {
        self.data
            .get(bucket)
            .is_some_and(|m| m.contains_key(fingerprint))
    }

    /// Record a sighting at the current wall-clock second.
    pub fn mark_seen(&mut self, bucket: &str, fingerprint: &str) {
        self.mark_seen_at(bucket, fingerprint, Utc::now().timestamp());
    }

    /// Record a sighting at `epoch`. The first-seen timestamp is kept on repeats.
    pub fn mark_seen_at(&mut self, bucket: &str, fingerprint: &str, epoch: i64) {
        let entries = self.data.entry(bucket.to_string()).or_default();
        let inserted = if entries.contains_key(fingerprint) {
            false
        } else {
            entries.insert(fingerprint.to_string(), epoch);
            true
        };
        if inserted || self.dirty {
            self.persist();
        }
    }

    /// Drop entries older than the TTL relative to now.
    pub fn purge_old(&mut self) -> usize {
        self.purge_old_at(Utc::now().timestamp())
    }

    /// Drop entries with `ts < now - ttl` and any bucket left empty.
    /// Persists only when something was removed. Returns removed entry count.
    pub fn purge_old_at(&mut self, now: i64) -> usize {
        let cutoff = now.saturating_sub(self.ttl_secs);
        let mut removed = 0usize;
        let mut changed = false;

        self.data.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|_, ts| *ts >= cutoff);
            removed += before - entries.len();
            if before != entries.len() {
                changed = true;
            }
            if entries.is_empty() {
                changed = true;
                false
            } else {
                true
            }
        });

        if changed {
            counter!("dedup_entries_purged_total").increment(removed as u64);
            debug!(removed, cutoff, "seen store purged");
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.data.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful snapshot writes since open.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn persist(&mut self) {
        match write_atomic(&self.path, &self.data) {
            Ok(()) => {
                self.dirty = false;
                self.writes += 1;
            }
            Err(e) => {
                self.dirty = true;
                warn!(path = %self.path.display(), error = %e, "seen store write failed; keeping in-memory state");
            }
        }
    }
}

fn load(path: &Path) -> Buckets {
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Buckets::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "seen store unreadable; starting empty");
            return Buckets::new();
        }
    };
    match serde_json::from_str(&s) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "seen store corrupt; starting empty");
            Buckets::new()
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "seen.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, data: &Buckets) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec_pretty(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tmp = tmp_path(path);
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    #[test]
    fn fingerprint_joins_with_pipes() {
        assert_eq!(fingerprint("usgs", &["nc123"]), "usgs|nc123");
        assert_eq!(
            fingerprint("caltrans", &["cc", "Closure", "37.5", "-122.0"]),
            "caltrans|cc|Closure|37.5|-122.0"
        );
        assert_eq!(fingerprint::<&str>("x", &[]), "x");
    }

    #[test]
    fn mark_then_seen_then_purged_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = SeenStore::open(dir.path().join("seen.json"), 7);
        let t0 = 1_700_000_000;
        assert!(!s.is_seen("nws", "nws|a"));
        s.mark_seen_at("nws", "nws|a", t0);
        assert!(s.is_seen("nws", "nws|a"));

        // still inside the window
        assert_eq!(s.purge_old_at(t0 + 7 * DAY), 0);
        assert!(s.is_seen("nws", "nws|a"));

        assert_eq!(s.purge_old_at(t0 + 7 * DAY + 1), 1);
        assert!(!s.is_seen("nws", "nws|a"));
        assert!(s.is_empty());
    }

    #[test]
    fn purge_is_idempotent_and_skips_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = SeenStore::open(dir.path().join("seen.json"), 1);
        s.mark_seen_at("b", "b|1", 100);
        s.mark_seen_at("b", "b|2", 100 + 2 * DAY);
        let writes = s.writes();

        assert_eq!(s.purge_old_at(100 + 2 * DAY), 1);
        assert_eq!(s.writes(), writes + 1);

        assert_eq!(s.purge_old_at(100 + 2 * DAY), 0);
        assert_eq!(s.writes(), writes + 1);
        assert!(s.is_seen("b", "b|2"));
    }

    #[test]
    fn repeat_mark_keeps_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        let mut s = SeenStore::open(&path, 1);
        s.mark_seen_at("b", "b|1", 100);
        let writes = s.writes();
        s.mark_seen_at("b", "b|1", 100 + 5 * DAY);
        assert_eq!(s.writes(), writes);

        // first-seen is what ages out
        assert_eq!(s.purge_old_at(100 + 2 * DAY), 1);
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("seen.json");
        {
            let mut s = SeenStore::open(&path, 7);
            s.mark_seen_at("usgs", "usgs|x", 42);
        }
        let s = SeenStore::open(&path, 7);
        assert!(s.is_seen("usgs", "usgs|x"));
        assert!(!tmp_path(&path).exists());

        let raw = fs::read_to_string(&path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["usgs"]["usgs|x"], 42);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        fs::write(&path, "{ not json").unwrap();
        let mut s = SeenStore::open(&path, 7);
        assert!(s.is_empty());

        s.mark_seen_at("b", "b|1", 1);
        let s2 = SeenStore::open(&path, 7);
        assert!(s2.is_seen("b", "b|1"));
    }

    #[test]
    fn write_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // parent "directory" is a regular file, so every write fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let mut s = SeenStore::open(blocker.join("seen.json"), 7);

        s.mark_seen_at("b", "b|1", 1);
        assert!(s.is_seen("b", "b|1"));
        assert_eq!(s.writes(), 0);
    }
}
