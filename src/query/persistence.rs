use std::sync::Arc;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use crate::archive::cold_store::ColdStore;
use crate::core::auth::Authenticator;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::UserId;
use crate::kvs::KeyValueStore;
use crate::query::chain::{QueryChain, QueryChainRecord};
use crate::query::ident::{derive_chain_id, is_valid_id};

pub const RECORD_PREFIX: &str = "concordance:";
pub const ARCHIVE_QUEUE_KEY: &str = "conc_arch_queue";

const SECONDS_PER_DAY: u64 = 86_400;

pub fn record_key(id: &str) -> String {
    format!("{}{}", RECORD_PREFIX, id)
}

/// Hot copy of a record, if any
pub fn read_hot(kvs: &dyn KeyValueStore, id: &str) -> Result<Option<QueryChainRecord>> {
    match kvs.get(&record_key(id))? {
        Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
            Error::new(
                ErrorKind::StorageUnavailable,
                format!("corrupted record '{}': {}", id, e),
            )
        })?)),
        None => Ok(None),
    }
}

/// Persistent store of query chains
pub trait QueryPersistence: Send + Sync {
    /// Persist `curr` and return its id. If `prev` holds the same chain,
    /// only its access metadata changes and its id is returned.
    fn store(&self, user_id: UserId, curr: &QueryChain, prev: Option<&QueryChainRecord>) -> Result<String>;

    /// Read without authorization; records the access
    fn open(&self, id: &str) -> Result<Option<QueryChainRecord>>;

    /// Flip the archived flag. Only the owner may do so.
    fn archive(&self, user_id: UserId, id: &str, revoke: bool) -> Result<(usize, QueryChainRecord)>;

    fn is_archived(&self, id: &str) -> Result<bool>;

    fn get_conc_ttl_days(&self, user_id: UserId) -> u32;

    fn is_valid_id(&self, id: &str) -> bool {
        is_valid_id(id)
    }
}

enum Location {
    Hot,
    Cold,
}

/// Hot records live in the KVS under `concordance:<id>` with a per-user TTL;
/// registered users' records are queued for the archival worker.
pub struct KvsQueryPersistence {
    pub kvs: Arc<dyn KeyValueStore>,
    pub cold: Arc<dyn ColdStore>,
    pub auth: Arc<dyn Authenticator>,
    pub registered_ttl_days: u32,
    pub anonymous_ttl_days: u32,
}

impl KvsQueryPersistence {
    pub fn new(
        kvs: Arc<dyn KeyValueStore>,
        cold: Arc<dyn ColdStore>,
        auth: Arc<dyn Authenticator>,
        registered_ttl_days: u32,
        anonymous_ttl_days: u32,
    ) -> Self {
        KvsQueryPersistence {
            kvs,
            cold,
            auth,
            registered_ttl_days,
            anonymous_ttl_days,
        }
    }

    fn write_hot(&self, record: &QueryChainRecord) -> Result<()> {
        let key = record_key(&record.id);
        let value: Value = serde_json::to_value(record)?;
        self.kvs.set(&key, &value)?;
        self.kvs.set_ttl(&key, self.get_conc_ttl_days(record.user_id) as u64 * SECONDS_PER_DAY)?;
        Ok(())
    }

    fn enqueue(&self, record: &QueryChainRecord) -> Result<()> {
        if !self.auth.is_anonymous(record.user_id) {
            self.kvs.list_append(ARCHIVE_QUEUE_KEY, &Value::String(record.id.clone()))?;
        }
        Ok(())
    }

    fn locate(&self, id: &str) -> Result<Option<(QueryChainRecord, Location)>> {
        if let Some(record) = read_hot(self.kvs.as_ref(), id)? {
            return Ok(Some((record, Location::Hot)));
        }
        Ok(self.cold.get(id)?.map(|record| (record, Location::Cold)))
    }

    /// Record an access wherever the record lives
    fn touch(&self, id: &str) -> Result<Option<QueryChainRecord>> {
        match self.locate(id)? {
            Some((mut record, Location::Hot)) => {
                record.touch();
                self.write_hot(&record)?;
                Ok(Some(record))
            }
            Some((mut record, Location::Cold)) => {
                record.touch();
                self.cold.touch(id, record.last_access_at)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl QueryPersistence for KvsQueryPersistence {
    fn store(&self, user_id: UserId, curr: &QueryChain, prev: Option<&QueryChainRecord>) -> Result<String> {
        curr.validate()?;

        if let Some(prev) = prev {
            if prev.data.canonical_json()? == curr.canonical_json()? {
                self.touch(&prev.id)?;
                debug!(id = %prev.id, "chain unchanged, reusing previous record");
                return Ok(prev.id.clone());
            }
        }

        let id = derive_chain_id(curr);
        if self.touch(&id)?.is_some() {
            debug!(id = %id, "chain already stored");
            return Ok(id);
        }

        let record = QueryChainRecord::new(id.clone(), user_id, curr.clone());
        self.write_hot(&record)?;
        self.enqueue(&record)?;
        info!(id = %id, user_id = %user_id, corpname = %curr.corpname, "stored query chain");
        Ok(id)
    }

    fn open(&self, id: &str) -> Result<Option<QueryChainRecord>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        self.touch(id)
    }

    fn archive(&self, user_id: UserId, id: &str, revoke: bool) -> Result<(usize, QueryChainRecord)> {
        let (mut record, location) = self
            .locate(id)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("query chain '{}' not found", id)))?;

        if record.user_id != user_id {
            return Err(Error::new(
                ErrorKind::Forbidden,
                format!("user {} does not own query chain '{}'", user_id, id),
            ));
        }

        match (location, revoke) {
            (Location::Cold, false) | (Location::Hot, true) => Ok((0, record)),
            (Location::Hot, false) => {
                record.archived = true;
                record.last_access_at = Utc::now();
                self.cold.insert_batch(std::slice::from_ref(&record))?;
                self.kvs.remove(&record_key(id))?;
                info!(id, "query chain archived");
                Ok((1, record))
            }
            (Location::Cold, true) => {
                record.archived = false;
                record.last_access_at = Utc::now();
                self.write_hot(&record)?;
                self.enqueue(&record)?;
                self.cold.remove(id)?;
                info!(id, "query chain archivation revoked");
                Ok((1, record))
            }
        }
    }

    fn is_archived(&self, id: &str) -> Result<bool> {
        Ok(matches!(self.locate(id)?, Some((record, Location::Cold)) if record.archived))
    }

    fn get_conc_ttl_days(&self, user_id: UserId) -> u32 {
        if self.auth.is_anonymous(user_id) {
            self.anonymous_ttl_days
        } else {
            self.registered_ttl_days
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::cold_store::SqliteColdStore;
    use crate::core::auth::StaticAuth;
    use crate::kvs::MemoryKvs;
    use crate::query::operation::{QueryArgs, QueryOperation, ShuffleArgs};

    fn qcs() -> (KvsQueryPersistence, Arc<MemoryKvs>) {
        let kvs = Arc::new(MemoryKvs::new());
        let qcs = KvsQueryPersistence::new(
            kvs.clone(),
            Arc::new(SqliteColdStore::open_in_memory().unwrap()),
            Arc::new(StaticAuth::default()),
            100,
            7,
        );
        (qcs, kvs)
    }

    fn chain() -> QueryChain {
        QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#))
    }

    #[test]
    fn test_store_is_idempotent() {
        let (qcs, kvs) = qcs();
        let a = qcs.store(UserId(1), &chain(), None).unwrap();
        let b = qcs.store(UserId(1), &chain(), None).unwrap();
        assert_eq!(a, b);
        assert_eq!(kvs.keys_with_prefix(RECORD_PREFIX).unwrap().len(), 1);
        assert_eq!(kvs.list_len(ARCHIVE_QUEUE_KEY).unwrap(), 1);
    }

    #[test]
    fn test_equal_prev_returns_prev_id() {
        let (qcs, _) = qcs();
        let id = qcs.store(UserId(1), &chain(), None).unwrap();
        let prev = qcs.open(&id).unwrap().unwrap();
        assert_eq!(qcs.store(UserId(1), &chain(), Some(&prev)).unwrap(), id);

        let longer = chain().then(QueryOperation::Shuffle(ShuffleArgs {}));
        let other = qcs.store(UserId(1), &longer, Some(&prev)).unwrap();
        assert_ne!(other, id);
    }

    #[test]
    fn test_anonymous_ttl_and_no_queue() {
        let (qcs, kvs) = qcs();
        let id = qcs.store(UserId(0), &chain(), None).unwrap();
        let ttl = kvs.get_ttl(&record_key(&id)).unwrap().unwrap();
        assert!(ttl <= 7 * SECONDS_PER_DAY && ttl > 6 * SECONDS_PER_DAY);
        assert_eq!(kvs.list_len(ARCHIVE_QUEUE_KEY).unwrap(), 0);
        assert_eq!(qcs.get_conc_ttl_days(UserId(0)), 7);
        assert_eq!(qcs.get_conc_ttl_days(UserId(5)), 100);
    }

    #[test]
    fn test_open_counts_access() {
        let (qcs, _) = qcs();
        let id = qcs.store(UserId(1), &chain(), None).unwrap();
        qcs.open(&id).unwrap();
        let record = qcs.open(&id).unwrap().unwrap();
        assert_eq!(record.num_access, 2);
        assert!(qcs.open("bad id").unwrap().is_none());
        assert!(qcs.open("000000000000").unwrap().is_none());
    }

    #[test]
    fn test_archive_owner_only() {
        let (qcs, kvs) = qcs();
        let id = qcs.store(UserId(1), &chain(), None).unwrap();

        let err = qcs.archive(UserId(2), &id, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(kvs.exists(&record_key(&id)).unwrap());
        assert!(!qcs.is_archived(&id).unwrap());

        let (updates, row) = qcs.archive(UserId(1), &id, false).unwrap();
        assert_eq!(updates, 1);
        assert!(row.archived);
        assert!(qcs.is_archived(&id).unwrap());
        assert!(!kvs.exists(&record_key(&id)).unwrap());
        assert_eq!(qcs.archive(UserId(1), &id, false).unwrap().0, 0);
        assert!(qcs.open(&id).unwrap().is_some());

        let (updates, row) = qcs.archive(UserId(1), &id, true).unwrap();
        assert_eq!(updates, 1);
        assert!(!row.archived);
        assert!(!qcs.is_archived(&id).unwrap());
        assert!(kvs.exists(&record_key(&id)).unwrap());
    }

    #[test]
    fn test_archive_unknown_is_not_found() {
        let (qcs, _) = qcs();
        assert_eq!(qcs.archive(UserId(1), "000000000000", false).unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_invalid_chain_rejected() {
        let (qcs, _) = qcs();
        let mut bad = chain();
        bad.operations.clear();
        assert_eq!(qcs.store(UserId(1), &bad, None).unwrap_err().kind, ErrorKind::BadInput);
    }
}
