use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::kvs::memory::{expire_op, hash_set_op, list_append_op, set_op, MemoryKvs};
use crate::kvs::{KeyValueStore, KvsOp};

const CHECKPOINT_FILE: &str = "kvs.checkpoint";
const MAX_ENTRY_LEN: usize = 10_000_000;
const BATCH_SYNC_EVERY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Immediate,  // fsync after every write
    Batch,      // fsync every few writes
    None,       // Let OS handle it
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub op: KvsOp,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the whole store; journal entries below `sequence` are covered by it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvsCheckpoint {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub slots: Vec<(String, String, Option<i64>)>,
}

/// Append-only log of KVS mutations, `[u32 len][bincode JournalEntry]` frames
pub struct Journal {
    pub file: File,
    pub path: PathBuf,
    pub position: u64,
    pub sequence: u64,
    pub sync_mode: SyncMode,
    pub unsynced: usize,
}

fn journal_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("journal_{:08}.log", sequence))
}

impl Journal {
    pub fn open(dir: &Path, sequence: u64, sync_mode: SyncMode) -> Result<Self> {
        let path = journal_path(dir, sequence);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let position = file.metadata()?.len();

        Ok(Journal {
            file,
            path,
            position,
            sequence,
            sync_mode,
            unsynced: 0,
        })
    }

    pub fn append(&mut self, op: KvsOp) -> Result<()> {
        let entry = JournalEntry {
            sequence: self.sequence,
            op,
            timestamp: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        let len = data.len() as u32;

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&data)?;

        self.sequence += 1;
        self.position += 4 + data.len() as u64;
        self.unsynced += 1;

        match self.sync_mode {
            SyncMode::Immediate => self.sync()?,
            SyncMode::Batch if self.unsynced >= BATCH_SYNC_EVERY => self.sync()?,
            _ => {}
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Continue in a fresh file starting at the current sequence
    pub fn rotate(&mut self, dir: &Path) -> Result<()> {
        self.sync()?;
        let new_journal = Journal::open(dir, self.sequence, self.sync_mode)?;
        *self = new_journal;
        Ok(())
    }

    /// Entries of one journal file plus the length of its intact prefix.
    /// A torn final frame ends the log.
    pub fn read_entries(path: &Path) -> Result<(Vec<JournalEntry>, u64, bool)> {
        let mut file = File::open(path)?;
        let mut entries = Vec::new();
        let mut good_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    let torn = file.metadata()?.len() != good_len;
                    return Ok((entries, good_len, torn));
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_ENTRY_LEN {
                return Err(Error::new(
                    ErrorKind::StorageUnavailable,
                    format!("journal entry too large in {}, possibly corrupted", path.display()),
                ));
            }

            let mut data = vec![0u8; len];
            if let Err(e) = file.read_exact(&mut data) {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    return Ok((entries, good_len, true));
                }
                return Err(e.into());
            }

            match bincode::deserialize::<JournalEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping undecodable journal entry");
                }
            }
            good_len += 4 + len as u64;
        }
    }

    /// Journal files in `dir`, ordered by starting sequence
    pub fn find_journal_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("log") {
                continue;
            }
            let sequence = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("journal_"))
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                files.push((sequence, path));
            }
        }
        files.sort();
        Ok(files)
    }
}

/// `MemoryKvs` made durable: every mutation is journaled, `checkpoint`
/// snapshots the state and starts a new journal.
pub struct JournaledKvs {
    pub inner: MemoryKvs,
    pub journal: Mutex<Journal>,
    pub dir: PathBuf,
}

impl JournaledKvs {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, SyncMode::Batch)
    }

    pub fn open_with(dir: &Path, sync_mode: SyncMode) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let inner = MemoryKvs::new();

        let mut next_sequence = 0;
        if let Some(checkpoint) = load_checkpoint(dir)? {
            next_sequence = checkpoint.sequence;
            inner.import(checkpoint.slots)?;
        }
        let covered = next_sequence;

        let mut replayed = 0usize;
        for (_, path) in Journal::find_journal_files(dir)? {
            let (entries, good_len, torn) = Journal::read_entries(&path)?;
            if torn {
                warn!(path = %path.display(), good_len, "truncating torn journal tail");
                OpenOptions::new().write(true).open(&path)?.set_len(good_len)?;
            }
            for entry in entries.into_iter().filter(|e| e.sequence >= covered) {
                if let Err(e) = inner.apply(&entry.op) {
                    warn!(sequence = entry.sequence, error = %e, "journal entry failed to replay");
                }
                next_sequence = next_sequence.max(entry.sequence + 1);
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(dir = %dir.display(), replayed, "KVS journal replayed");
        }

        let journal = Journal::open(dir, next_sequence, sync_mode)?;
        Ok(JournaledKvs {
            inner,
            journal: Mutex::new(journal),
            dir: dir.to_path_buf(),
        })
    }

    /// Write a snapshot, rotate the journal and drop the files it covers
    pub fn checkpoint(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        let checkpoint = KvsCheckpoint {
            sequence: journal.sequence,
            timestamp: Utc::now(),
            slots: self.inner.export()?,
        };

        let path = self.dir.join(CHECKPOINT_FILE);
        let tmp = self.dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, bincode::serialize(&checkpoint)?)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &path)?;

        journal.rotate(&self.dir)?;
        for (sequence, old) in Journal::find_journal_files(&self.dir)? {
            if sequence < checkpoint.sequence {
                fs::remove_file(&old)?;
            }
        }
        debug!(sequence = checkpoint.sequence, keys = checkpoint.slots.len(), "KVS checkpoint written");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.journal.lock().sync()
    }

    /// Bytes in the current journal file
    pub fn journal_len(&self) -> u64 {
        self.journal.lock().position
    }

    fn record(&self, op: KvsOp) -> Result<Option<Value>> {
        let mut journal = self.journal.lock();
        let result = self.inner.apply(&op)?;
        journal.append(op)?;
        Ok(result)
    }
}

fn load_checkpoint(dir: &Path) -> Result<Option<KvsCheckpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path)?;
    Ok(Some(bincode::deserialize(&data)?))
}

impl KeyValueStore for JournaledKvs {
    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.record(set_op(key, value)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn set_ttl(&self, key: &str, seconds: u64) -> Result<()> {
        self.record(expire_op(key, seconds))?;
        Ok(())
    }

    fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        self.inner.get_ttl(key)
    }

    fn hash_set(&self, key: &str, field: &str, value: &Value) -> Result<()> {
        self.record(hash_set_op(key, field, value)?)?;
        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>> {
        self.inner.hash_get(key, field)
    }

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, Value>> {
        self.inner.hash_get_all(key)
    }

    fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        let op = KvsOp::HashDel { key: key.to_string(), field: field.to_string() };
        Ok(self.record(op)?.is_some())
    }

    fn list_append(&self, key: &str, value: &Value) -> Result<usize> {
        self.record(list_append_op(key, value)?)?;
        self.inner.list_len(key)
    }

    fn list_pop(&self, key: &str) -> Result<Option<Value>> {
        self.record(KvsOp::ListPop { key: key.to_string() })
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        self.inner.list_len(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.record(KvsOp::Remove { key: key.to_string() })?.is_some())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(KvsOp::Rename { from: from.to_string(), to: to.to_string() })?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    // Expiry stamps are absolute, so replay drops the same keys; nothing to journal
    fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kvs = JournaledKvs::open(dir.path()).unwrap();
            kvs.set("a", &json!({"n": 1})).unwrap();
            kvs.set_ttl("a", 3600).unwrap();
            kvs.list_append("q", &json!("x")).unwrap();
            kvs.list_append("q", &json!("y")).unwrap();
            kvs.list_pop("q").unwrap();
            kvs.hash_set("h", "f", &json!(true)).unwrap();
            kvs.sync().unwrap();
        }

        let kvs = JournaledKvs::open(dir.path()).unwrap();
        assert_eq!(kvs.get("a").unwrap(), Some(json!({"n": 1})));
        assert!(kvs.get_ttl("a").unwrap().unwrap() > 3500);
        assert_eq!(kvs.list_pop("q").unwrap(), Some(json!("y")));
        assert_eq!(kvs.hash_get("h", "f").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_checkpoint_drops_old_journals() {
        let dir = TempDir::new().unwrap();
        {
            let kvs = JournaledKvs::open(dir.path()).unwrap();
            for i in 0..10 {
                kvs.set(&format!("k{}", i), &json!(i)).unwrap();
            }
            kvs.checkpoint().unwrap();
            kvs.remove("k0").unwrap();
            kvs.sync().unwrap();
        }

        let files = Journal::find_journal_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, 10);

        let kvs = JournaledKvs::open(dir.path()).unwrap();
        assert_eq!(kvs.keys_with_prefix("k").unwrap().len(), 9);
        assert_eq!(kvs.get("k9").unwrap(), Some(json!(9)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let kvs = JournaledKvs::open(dir.path()).unwrap();
            kvs.set("a", &json!(1)).unwrap();
            kvs.sync().unwrap();
        }
        let (_, path) = Journal::find_journal_files(dir.path()).unwrap().remove(0);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let kvs = JournaledKvs::open(dir.path()).unwrap();
        assert_eq!(kvs.get("a").unwrap(), Some(json!(1)));
        kvs.set("b", &json!(2)).unwrap();
        kvs.sync().unwrap();
        drop(kvs);

        let kvs = JournaledKvs::open(dir.path()).unwrap();
        assert_eq!(kvs.get("b").unwrap(), Some(json!(2)));
    }
}
