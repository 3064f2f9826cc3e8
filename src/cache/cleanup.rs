use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::cache::map::{CacheEntry, ConcCacheMap, MapKey};
use crate::core::error::Result;
use crate::storage::layout::{CONC_EXT, PID_EXT};

/// What one cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub corpora: usize,
    pub missing_files: usize,
    pub aged_out: usize,
    pub evicted: usize,
    pub orphan_files: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.corpora += other.corpora;
        self.missing_files += other.missing_files;
        self.aged_out += other.aged_out;
        self.evicted += other.evicted;
        self.orphan_files += other.orphan_files;
        self.bytes_before += other.bytes_before;
        self.bytes_after += other.bytes_after;
    }
}

/// Age and size based eviction over every corpus directory.
/// Entries guarded by a pidfile are never touched.
pub struct CacheCleaner {
    pub map: Arc<ConcCacheMap>,
    pub max_age: Duration,      // Zero disables age eviction
    pub max_bytes: u64,         // Per corpus, zero disables
}

impl CacheCleaner {
    pub fn new(map: Arc<ConcCacheMap>, max_age: Duration, max_bytes: u64) -> Self {
        CacheCleaner { map, max_age, max_bytes }
    }

    pub fn run(&self) -> Result<CleanupReport> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for corpname in self.map.corpora()? {
            report.merge(self.run_corpus(&corpname, now)?);
        }
        if report.aged_out + report.evicted + report.missing_files + report.orphan_files > 0 {
            info!(
                aged_out = report.aged_out,
                evicted = report.evicted,
                missing = report.missing_files,
                orphans = report.orphan_files,
                bytes_after = report.bytes_after,
                "cache cleanup finished"
            );
        }
        Ok(report)
    }

    pub fn run_corpus(&self, corpname: &str, now: DateTime<Utc>) -> Result<CleanupReport> {
        let dir = self.map.layout.corpus_dir(corpname);
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);

        self.map.update_map(corpname, |state, unlink| {
            let mut report = CleanupReport { corpora: 1, ..Default::default() };
            let guarded = |entry: &CacheEntry| {
                entry.pid_file.as_ref().is_some_and(|p| dir.join(p).exists())
            };

            let missing: Vec<MapKey> = state
                .entries
                .iter()
                .filter(|(_, e)| !dir.join(&e.file_name).exists())
                .map(|(k, _)| k.clone())
                .collect();
            for key in missing {
                if let Some(entry) = state.entries.remove(&key) {
                    if let Some(pid) = entry.pid_file {
                        unlink.push(dir.join(pid));
                    }
                    report.missing_files += 1;
                }
            }

            if !self.max_age.is_zero() {
                let expired: Vec<MapKey> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| e.complete && !guarded(e) && now - e.last_access_at > max_age)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in expired {
                    if let Some(entry) = state.entries.remove(&key) {
                        unlink.push(dir.join(&entry.file_name));
                        report.aged_out += 1;
                    }
                }
            }

            let mut sized: Vec<(MapKey, u64, DateTime<Utc>, bool)> = state
                .entries
                .iter()
                .map(|(k, e)| {
                    let len = fs::metadata(dir.join(&e.file_name)).map(|m| m.len()).unwrap_or(0);
                    (k.clone(), len, e.last_access_at, e.complete && !guarded(e))
                })
                .collect();
            let mut total: u64 = sized.iter().map(|(_, len, _, _)| len).sum();
            report.bytes_before = total;

            if self.max_bytes > 0 && total > self.max_bytes {
                sized.sort_by_key(|(_, _, last_access, _)| *last_access);
                for (key, len, _, evictable) in sized {
                    if total <= self.max_bytes {
                        break;
                    }
                    if !evictable {
                        continue;
                    }
                    if let Some(entry) = state.entries.remove(&key) {
                        unlink.push(dir.join(&entry.file_name));
                        total = total.saturating_sub(len);
                        report.evicted += 1;
                    }
                }
            }
            report.bytes_after = total;

            let referenced: HashSet<String> = state
                .entries
                .values()
                .flat_map(|e| std::iter::once(e.file_name.clone()).chain(e.pid_file.clone()))
                .collect();
            for item in fs::read_dir(&dir)? {
                let path = item?.path();
                let ext = path.extension().and_then(|e| e.to_str());
                if ext != Some(CONC_EXT) && ext != Some(PID_EXT) {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                if !referenced.contains(name) && !unlink.contains(&path) {
                    debug!(path = %path.display(), "removing orphan cache file");
                    unlink.push(path);
                    report.orphan_files += 1;
                }
            }

            Ok(report)
        })
    }
}
