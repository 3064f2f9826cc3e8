use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::cache::key::{CacheKey, SubcorpusHash};
use crate::core::error::{Error, ErrorKind, Result};
use crate::flight::liveness::StalePolicy;
use crate::storage::file_lock::FileLock;
use crate::storage::layout::{CacheLayout, CONC_EXT, PID_EXT};
use crate::storage::pidfile::{PidFile, PidInfo, PidState};

const STATE_VERSION: u32 = 1;

/// Map identity inside one corpus directory
pub type MapKey = (Option<SubcorpusHash>, Vec<String>);

/// One cached concordance.
/// `complete` is only set by the producer's final publish; an incomplete
/// entry without a pidfile is an orphan and may be reclaimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_name: String,
    pub size_seen: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub pid_file: Option<String>,
    pub task_id: Option<String>,
    pub complete: bool,
}

impl CacheEntry {
    fn new(file_name: String, pid_file: Option<String>, task_id: Option<String>) -> Self {
        let now = Utc::now();
        CacheEntry {
            file_name,
            size_seen: 0,
            created_at: now,
            last_access_at: now,
            pid_file,
            task_id,
            complete: false,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.pid_file.is_some()
    }

    fn owned_by(&self, task_id: &str) -> bool {
        self.task_id.as_deref() == Some(task_id)
    }
}

/// Persisted state of one corpus directory (`00CONCS.map`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcMapState {
    pub version: u32,
    pub corpname: String,
    pub entries: HashMap<MapKey, CacheEntry>,
}

/// Result of trying to claim a key
#[derive(Debug, Clone)]
pub enum Registration {
    /// Caller owns the pidfile and must produce the file
    Producer {
        conc_path: PathBuf,
        pid_path: PathBuf,
        reclaimed: bool,
    },
    /// Somebody else is producing
    Reader {
        conc_path: PathBuf,
        pid_path: PathBuf,
        owner: PidInfo,
    },
    /// Finished result
    Ready { conc_path: PathBuf, entry: CacheEntry },
}

/// Concordance cache map. All mutations run under the exclusive
/// per-corpus map lock; the pidfile is always taken after the map lock.
pub struct ConcCacheMap {
    pub layout: CacheLayout,
    pub lock_timeout: Duration,
}

impl ConcCacheMap {
    pub fn new(layout: CacheLayout, lock_timeout: Duration) -> Self {
        ConcCacheMap { layout, lock_timeout }
    }

    pub fn open(cache_dir: &Path, lock_timeout: Duration) -> Result<Self> {
        Ok(ConcCacheMap::new(CacheLayout::new(cache_dir.to_path_buf())?, lock_timeout))
    }

    fn lock(&self, corpname: &str, exclusive: bool) -> Result<FileLock> {
        self.layout.ensure_corpus_dir(corpname)?;
        FileLock::acquire(&self.layout.map_lock_path(corpname), exclusive, self.lock_timeout)
    }

    fn load_state(&self, corpname: &str) -> Result<ConcMapState> {
        let path = self.layout.map_path(corpname);
        let fresh = || ConcMapState {
            version: STATE_VERSION,
            corpname: corpname.to_string(),
            entries: HashMap::new(),
        };

        match fs::read(&path) {
            Ok(data) => match bincode::deserialize::<ConcMapState>(&data) {
                Ok(state) if state.version == STATE_VERSION => Ok(state),
                Ok(state) => {
                    warn!(corpname, version = state.version, "unknown cache map version, starting empty");
                    Ok(fresh())
                }
                Err(e) => {
                    warn!(corpname, error = %e, "corrupted cache map, starting empty");
                    Ok(fresh())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(fresh()),
            Err(e) => Err(Error::new(
                ErrorKind::StorageUnavailable,
                format!("failed to read {}: {}", path.display(), e),
            )),
        }
    }

    fn save_state(&self, corpname: &str, state: &ConcMapState) -> Result<()> {
        let path = self.layout.map_path(corpname);
        let tmp = path.with_extension("map.tmp");
        fs::write(&tmp, bincode::serialize(state)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Run `f` on a snapshot under the shared lock
    pub(crate) fn read_map<R>(&self, corpname: &str, f: impl FnOnce(&ConcMapState) -> R) -> Result<R> {
        let _lock = self.lock(corpname, false)?;
        let state = self.load_state(corpname)?;
        Ok(f(&state))
    }

    /// Run `f` under the exclusive lock and persist the state. Paths pushed
    /// to the unlink list are removed after the state is saved, still under the lock.
    pub(crate) fn update_map<R>(
        &self,
        corpname: &str,
        f: impl FnOnce(&mut ConcMapState, &mut Vec<PathBuf>) -> Result<R>,
    ) -> Result<R> {
        let _lock = self.lock(corpname, true)?;
        let mut state = self.load_state(corpname)?;
        let mut unlink = Vec::new();

        let result = f(&mut state, &mut unlink)?;
        state.version = STATE_VERSION;
        state.corpname = corpname.to_string();
        self.save_state(corpname, &state)?;

        for path in unlink {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache file"),
            }
        }
        Ok(result)
    }

    pub fn entry_path(&self, corpname: &str, entry: &CacheEntry) -> PathBuf {
        self.layout.corpus_dir(corpname).join(&entry.file_name)
    }

    fn pid_path_of(&self, corpname: &str, entry: &CacheEntry) -> Option<PathBuf> {
        entry
            .pid_file
            .as_ref()
            .map(|name| self.layout.corpus_dir(corpname).join(name))
    }

    fn pid_present(&self, corpname: &str, entry: &CacheEntry) -> bool {
        self.pid_path_of(corpname, entry).is_some_and(|p| p.exists())
    }

    /// Ensure the directory exists and drop entries whose file vanished
    pub fn refresh_map(&self, corpname: &str) -> Result<usize> {
        self.update_map(corpname, |state, unlink| {
            let dir = self.layout.corpus_dir(corpname);
            let missing: Vec<MapKey> = state
                .entries
                .iter()
                .filter(|(_, e)| !dir.join(&e.file_name).exists())
                .map(|(k, _)| k.clone())
                .collect();

            for key in &missing {
                if let Some(entry) = state.entries.remove(key) {
                    if let Some(pid) = entry.pid_file {
                        unlink.push(dir.join(pid));
                    }
                }
            }
            if !missing.is_empty() {
                warn!(corpname, dropped = missing.len(), "dropped cache entries without files");
            }
            Ok(missing.len())
        })
    }

    pub fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let map_key = (key.subchash, key.q.clone());
        self.read_map(&key.corpname, |state| state.entries.get(&map_key).cloned())
    }

    pub fn cache_file_path(&self, key: &CacheKey) -> Result<Option<PathBuf>> {
        Ok(self
            .get_entry(key)?
            .map(|entry| self.entry_path(&key.corpname, &entry)))
    }

    pub fn get_stored_size(&self, key: &CacheKey) -> Result<Option<u64>> {
        Ok(self.get_entry(key)?.map(|entry| entry.size_seen))
    }

    /// Create or update an entry. Sizes only grow. An entry created without
    /// a pidfile is a finished result.
    pub fn add_to_map(
        &self,
        key: &CacheKey,
        size: u64,
        pid_file: Option<&Path>,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let corpname = key.corpname.as_str();
        self.update_map(corpname, |state, _| {
            let map_key = (key.subchash, key.q.clone());
            if let Some(entry) = state.entries.get_mut(&map_key) {
                entry.size_seen = entry.size_seen.max(size);
                entry.last_access_at = Utc::now();
                let entry = entry.clone();
                return Ok((self.entry_path(corpname, &entry), self.pid_path_of(corpname, &entry)));
            }

            let slug = self.choose_slug(state, key);
            let file_name = format!("{}.{}", slug, CONC_EXT);
            let conc_path = self.layout.corpus_dir(corpname).join(&file_name);
            fs::File::create(&conc_path)?;

            let pid_name = pid_file
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string);
            let mut entry = CacheEntry::new(file_name, pid_name, None);
            entry.size_seen = size;
            entry.complete = entry.pid_file.is_none();

            let stored_pid = self.pid_path_of(corpname, &entry);
            state.entries.insert(map_key, entry);
            Ok((conc_path, stored_pid))
        })
    }

    /// Slug not used by another entry and without leftover files on disk
    fn choose_slug(&self, state: &ConcMapState, key: &CacheKey) -> String {
        let base = key.slug_base();
        let mut suffix = 0u32;
        loop {
            let slug = if suffix == 0 { base.clone() } else { format!("{}{}", base, suffix) };
            let file_name = format!("{}.{}", slug, CONC_EXT);
            let taken = state.entries.values().any(|e| e.file_name == file_name)
                || self.layout.conc_path(&key.corpname, &slug).exists()
                || self.layout.pid_path(&key.corpname, &slug).exists();
            if !taken {
                return slug;
            }
            suffix += 1;
        }
    }

    /// Atomic claim: inspect the entry and its pidfile under the map lock
    /// and either hand out the producer role, attach as reader or return
    /// the finished result.
    pub fn register(&self, key: &CacheKey, claimant: &PidInfo, policy: &StalePolicy) -> Result<Registration> {
        let corpname = key.corpname.as_str();
        self.update_map(corpname, |state, _| {
            let map_key = (key.subchash, key.q.clone());
            let dir = self.layout.corpus_dir(corpname);

            if let Some(entry) = state.entries.get_mut(&map_key) {
                let conc_path = dir.join(&entry.file_name);
                match entry.pid_file.clone() {
                    Some(pid_name) => {
                        let pid_path = dir.join(pid_name);
                        match PidFile::read(&pid_path)? {
                            PidState::Present(owner) if !policy.is_stale(&owner) => {
                                return Ok(Registration::Reader { conc_path, pid_path, owner });
                            }
                            PidState::Present(owner) => {
                                warn!(key = %key, owner_pid = owner.pid, owner_task = %owner.task_id, "reclaiming stale cache entry");
                            }
                            PidState::Missing if entry.complete => {
                                entry.pid_file = None;
                                entry.last_access_at = Utc::now();
                                return Ok(Registration::Ready { conc_path, entry: entry.clone() });
                            }
                            _ => warn!(key = %key, "reclaiming cache entry with lost producer"),
                        }
                    }
                    None if entry.complete => {
                        entry.last_access_at = Utc::now();
                        return Ok(Registration::Ready { conc_path, entry: entry.clone() });
                    }
                    None => warn!(key = %key, "reclaiming orphaned incomplete cache entry"),
                }

                // Reclaim: fresh inode so readers of the old file keep their view
                if let Some(old_pid) = entry.pid_file.take() {
                    PidFile::remove(&dir.join(old_pid))?;
                }
                match fs::remove_file(&conc_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }

                let slug = entry.file_name.trim_end_matches(&format!(".{}", CONC_EXT)).to_string();
                let pid_path = claim_pidfile(&dir, &slug, claimant)?;
                create_conc_file(&conc_path)?;

                let file_name = entry.file_name.clone();
                *entry = CacheEntry::new(
                    file_name,
                    Some(format!("{}.{}", slug, PID_EXT)),
                    Some(claimant.task_id.clone()),
                );
                return Ok(Registration::Producer { conc_path, pid_path, reclaimed: true });
            }

            let slug = self.choose_slug(state, key);
            let pid_path = claim_pidfile(&dir, &slug, claimant)?;
            let file_name = format!("{}.{}", slug, CONC_EXT);
            let conc_path = dir.join(&file_name);
            create_conc_file(&conc_path)?;

            state.entries.insert(
                map_key,
                CacheEntry::new(
                    file_name,
                    Some(format!("{}.{}", slug, PID_EXT)),
                    Some(claimant.task_id.clone()),
                ),
            );
            debug!(key = %key, task_id = %claimant.task_id, "claimed cache entry");
            Ok(Registration::Producer { conc_path, pid_path, reclaimed: false })
        })
    }

    /// Open the producer's file for writing, truncated. Ownership is checked
    /// and the file opened under the map lock, which every reclaim and removal
    /// also needs, so a producer that lost the entry never touches its
    /// successor's file.
    pub fn open_owned(&self, key: &CacheKey, task_id: &str) -> Result<(PathBuf, fs::File)> {
        self.read_map(&key.corpname, |state| {
            let map_key = (key.subchash, key.q.clone());
            match state.entries.get(&map_key) {
                Some(entry) if entry.owned_by(task_id) && !entry.complete => {
                    let path = self.entry_path(&key.corpname, entry);
                    let file = fs::OpenOptions::new().write(true).truncate(true).open(&path)?;
                    Ok((path, file))
                }
                _ => Err(Error::new(
                    ErrorKind::Cancelled,
                    format!("task {} no longer owns cache entry {}", task_id, key),
                )),
            }
        })?
    }

    /// Producer progress. Fails with `Cancelled` once the caller no longer owns the entry.
    pub fn publish(&self, key: &CacheKey, size: u64, task_id: &str, complete: bool) -> Result<u64> {
        self.update_map(&key.corpname, |state, _| {
            let map_key = (key.subchash, key.q.clone());
            let entry = match state.entries.get_mut(&map_key) {
                Some(entry) if entry.owned_by(task_id) => entry,
                _ => {
                    return Err(Error::new(
                        ErrorKind::Cancelled,
                        format!("task {} no longer owns cache entry {}", task_id, key),
                    ))
                }
            };
            entry.size_seen = entry.size_seen.max(size);
            if complete {
                entry.complete = true;
            }
            entry.last_access_at = Utc::now();
            Ok(entry.size_seen)
        })
    }

    /// Drop the producer's pidfile. Returns false if the caller lost ownership.
    pub fn release(&self, key: &CacheKey, task_id: &str) -> Result<bool> {
        self.update_map(&key.corpname, |state, _| {
            let dir = self.layout.corpus_dir(&key.corpname);
            let map_key = (key.subchash, key.q.clone());
            match state.entries.get_mut(&map_key) {
                Some(entry) if entry.owned_by(task_id) => {
                    if let Some(pid) = entry.pid_file.take() {
                        PidFile::remove_if_owned(&dir.join(pid), task_id)?;
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Failure cleanup of an owned entry: drop own pidfile, then remove the
    /// entry together with every unguarded entry sharing its base query.
    pub fn abandon(&self, key: &CacheKey, task_id: &str) -> Result<bool> {
        self.update_map(&key.corpname, |state, unlink| {
            let dir = self.layout.corpus_dir(&key.corpname);
            let map_key = (key.subchash, key.q.clone());
            match state.entries.get_mut(&map_key) {
                Some(entry) if entry.owned_by(task_id) => {
                    if let Some(pid) = entry.pid_file.take() {
                        PidFile::remove_if_owned(&dir.join(pid), task_id)?;
                    }
                }
                _ => return Ok(false),
            }
            let removed = self.remove_base_entries(state, key, unlink)?;
            info!(key = %key, task_id, removed, "abandoned cache entry");
            Ok(true)
        })
    }

    /// Remove all entries sharing the key's base query that no producer
    /// guards, plus the exact key
    pub fn del_full_entry(&self, key: &CacheKey) -> Result<usize> {
        self.del_full_entry_sparing(key, |_| false)
    }

    /// `del_full_entry` that keeps the exact entry when its running
    /// producer is accepted by `spare`
    pub fn del_full_entry_sparing(&self, key: &CacheKey, spare: impl Fn(&PidInfo) -> bool) -> Result<usize> {
        self.update_map(&key.corpname, |state, unlink| {
            let map_key = (key.subchash, key.q.clone());
            let running = match state.entries.get(&map_key).and_then(|e| self.pid_path_of(&key.corpname, e)) {
                Some(pid_path) => PidFile::read(&pid_path)?,
                None => PidState::Missing,
            };
            let keep_exact = matches!(&running, PidState::Present(owner) if spare(owner));
            if keep_exact {
                debug!(key = %key, "sparing entry of a running producer");
            }
            let removed = self.remove_entries(state, key, !keep_exact, unlink)?;
            debug!(key = %key, removed, "deleted cache entries");
            Ok(removed)
        })
    }

    fn remove_base_entries(&self, state: &mut ConcMapState, key: &CacheKey, unlink: &mut Vec<PathBuf>) -> Result<usize> {
        self.remove_entries(state, key, true, unlink)
    }

    fn remove_entries(
        &self,
        state: &mut ConcMapState,
        key: &CacheKey,
        with_exact: bool,
        unlink: &mut Vec<PathBuf>,
    ) -> Result<usize> {
        let corpname = key.corpname.as_str();
        let exact: MapKey = (key.subchash, key.q.clone());
        let victims: Vec<MapKey> = state
            .entries
            .iter()
            .filter(|(k, e)| {
                if *k == &exact {
                    return with_exact;
                }
                k.0 == key.subchash && k.1.first() == key.q.first() && !self.pid_present(corpname, e)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for victim in &victims {
            let Some(entry) = state.entries.remove(victim) else { continue };
            match self.pid_path_of(corpname, &entry) {
                // A live producer keeps writing its file; the cleaner removes it later
                Some(pid_path) if pid_path.exists() => PidFile::remove(&pid_path)?,
                _ => unlink.push(self.entry_path(corpname, &entry)),
            }
        }
        Ok(victims.len())
    }

    /// A reader found `owner` stale. Invalidate the entry unless it was
    /// reclaimed or completed in the meantime.
    pub fn invalidate_stale(&self, key: &CacheKey, owner: &PidInfo) -> Result<bool> {
        self.update_map(&key.corpname, |state, unlink| {
            let dir = self.layout.corpus_dir(&key.corpname);
            let map_key = (key.subchash, key.q.clone());
            let Some(entry) = state.entries.get_mut(&map_key) else { return Ok(false) };
            if entry.complete {
                return Ok(false);
            }
            if let Some(pid) = entry.pid_file.clone() {
                let pid_path = dir.join(pid);
                match PidFile::read(&pid_path)? {
                    PidState::Present(info) if info.task_id == owner.task_id => PidFile::remove(&pid_path)?,
                    PidState::Present(_) => return Ok(false),
                    PidState::Missing | PidState::Unreadable => PidFile::remove(&pid_path)?,
                }
                entry.pid_file = None;
            }
            self.remove_base_entries(state, key, unlink)?;
            warn!(key = %key, owner_task = %owner.task_id, "invalidated stale cache entry");
            Ok(true)
        })
    }

    pub fn touch(&self, key: &CacheKey) -> Result<bool> {
        self.update_map(&key.corpname, |state, _| {
            let map_key = (key.subchash, key.q.clone());
            Ok(match state.entries.get_mut(&map_key) {
                Some(entry) => {
                    entry.last_access_at = Utc::now();
                    true
                }
                None => false,
            })
        })
    }

    /// Corpus directories present in the cache
    pub fn corpora(&self) -> Result<Vec<String>> {
        self.layout.corpus_dirs()
    }

    pub fn entries(&self, corpname: &str) -> Result<Vec<(CacheKey, CacheEntry)>> {
        self.read_map(corpname, |state| {
            let name = if state.corpname.is_empty() { corpname } else { state.corpname.as_str() };
            state
                .entries
                .iter()
                .map(|((subchash, q), entry)| {
                    (
                        CacheKey {
                            corpname: name.to_string(),
                            subchash: *subchash,
                            q: q.clone(),
                        },
                        entry.clone(),
                    )
                })
                .collect()
        })
    }
}

/// A claim always starts on a new inode
fn create_conc_file(path: &Path) -> Result<()> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(())
}

fn claim_pidfile(dir: &Path, slug: &str, claimant: &PidInfo) -> Result<PathBuf> {
    let pid_path = dir.join(format!("{}.{}", slug, PID_EXT));
    if !PidFile::create(&pid_path, claimant)? {
        return Err(Error::new(
            ErrorKind::StorageUnavailable,
            format!("pidfile {} created outside the map lock", pid_path.display()),
        ));
    }
    Ok(pid_path)
}
