use std::fs;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use crate::core::error::Result;
use crate::core::types::{from_millis, to_millis, UserId};
use crate::query::chain::{QueryChain, QueryChainRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conc_archive (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    created INTEGER NOT NULL,
    last_access INTEGER NOT NULL,
    num_access INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS conc_archive_last_access ON conc_archive(last_access);
";

/// Durable store for aged query chain records
pub trait ColdStore: Send + Sync {
    /// Insert all records in one transaction; existing ids are kept (INSERT OR IGNORE).
    /// Returns how many rows were new.
    fn insert_batch(&self, records: &[QueryChainRecord]) -> Result<usize>;

    fn get(&self, id: &str) -> Result<Option<QueryChainRecord>>;

    /// Record an access. Returns false for unknown ids.
    fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    fn remove(&self, id: &str) -> Result<bool>;

    /// Delete rows not accessed since `cutoff`
    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn count(&self) -> Result<u64>;
}

/// SQLite-backed cold store
pub struct SqliteColdStore {
    pub conn: Mutex<Connection>,
    pub path: Option<PathBuf>,
}

impl SqliteColdStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteColdStore {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteColdStore {
            conn: Mutex::new(conn),
            path: None,
        })
    }
}

type RawRow = (String, i64, i64, i64, i64, String, i64);

fn into_record(raw: RawRow) -> Result<QueryChainRecord> {
    let (id, user_id, created, last_access, num_access, data, archived) = raw;
    let data: QueryChain = serde_json::from_str(&data)?;
    Ok(QueryChainRecord {
        id,
        user_id: UserId(user_id as u64),
        created_at: from_millis(created),
        last_access_at: from_millis(last_access),
        num_access: num_access.max(0) as u64,
        data,
        archived: archived != 0,
    })
}

impl ColdStore for SqliteColdStore {
    fn insert_batch(&self, records: &[QueryChainRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO conc_archive \
                 (id, user_id, created, last_access, num_access, data, archived) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.id,
                    record.user_id.value() as i64,
                    to_millis(record.created_at),
                    to_millis(record.last_access_at),
                    record.num_access as i64,
                    record.data.canonical_json()?,
                    record.archived as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get(&self, id: &str) -> Result<Option<QueryChainRecord>> {
        let raw: Option<RawRow> = self
            .conn
            .lock()
            .query_row(
                "SELECT id, user_id, created, last_access, num_access, data, archived \
                 FROM conc_archive WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        raw.map(into_record).transpose()
    }

    fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.lock().execute(
            "UPDATE conc_archive SET last_access = ?2, num_access = num_access + 1 WHERE id = ?1",
            params![id, to_millis(at)],
        )?;
        Ok(updated > 0)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM conc_archive WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM conc_archive WHERE last_access < ?1",
            params![to_millis(cutoff)],
        )?;
        Ok(deleted)
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM conc_archive", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::query::operation::QueryArgs;

    fn record(id: &str) -> QueryChainRecord {
        let mut r = QueryChainRecord::new(
            id.to_string(),
            UserId(3),
            QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#)),
        );
        r.archived = true;
        r
    }

    #[test]
    fn test_insert_or_ignore() {
        let store = SqliteColdStore::open_in_memory().unwrap();
        assert_eq!(store.insert_batch(&[record("a"), record("b")]).unwrap(), 2);
        assert_eq!(store.insert_batch(&[record("a"), record("c")]).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_get_roundtrip() {
        let store = SqliteColdStore::open_in_memory().unwrap();
        let r = record("a");
        store.insert_batch(std::slice::from_ref(&r)).unwrap();

        let back = store.get("a").unwrap().unwrap();
        assert_eq!(back.data, r.data);
        assert_eq!(back.user_id, UserId(3));
        assert!(back.archived);
        assert_eq!(to_millis(back.created_at), to_millis(r.created_at));
        assert!(store.get("zzz").unwrap().is_none());
    }

    #[test]
    fn test_touch_and_purge() {
        let store = SqliteColdStore::open_in_memory().unwrap();
        let mut old = record("old");
        old.last_access_at = Utc::now() - Duration::days(400);
        store.insert_batch(&[old, record("new")]).unwrap();

        assert!(store.touch("new", Utc::now()).unwrap());
        assert!(!store.touch("missing", Utc::now()).unwrap());
        assert_eq!(store.get("new").unwrap().unwrap().num_access, 1);

        assert_eq!(store.purge_older_than(Utc::now() - Duration::days(365)).unwrap(), 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.remove("new").unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }
}
