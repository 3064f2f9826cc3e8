pub mod memory;
pub mod journal;

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use crate::core::error::Result;

pub use memory::MemoryKvs;
pub use journal::JournaledKvs;

/// Small-value store with per-key TTL, hashes and FIFO lists.
/// Every operation is atomic on its own; there are no cross-key transactions.
pub trait KeyValueStore: Send + Sync {
    /// Replace the value and drop any expiry
    fn set(&self, key: &str, value: &Value) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Read that never fails: storage errors yield `default`
    fn get_or(&self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!(key, error = %e, "KVS read failed, using default");
                default
            }
        }
    }

    /// Expire `key` after `seconds`. Missing keys are ignored.
    fn set_ttl(&self, key: &str, seconds: u64) -> Result<()>;

    /// Remaining lifetime in seconds, `None` if the key has no expiry or is missing
    fn get_ttl(&self, key: &str) -> Result<Option<u64>>;

    fn hash_set(&self, key: &str, field: &str, value: &Value) -> Result<()>;

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>>;

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, Value>>;

    fn hash_del(&self, key: &str, field: &str) -> Result<bool>;

    /// Push to the back, returns the new length
    fn list_append(&self, key: &str, value: &Value) -> Result<usize>;

    /// Pop from the front
    fn list_pop(&self, key: &str) -> Result<Option<Value>>;

    fn list_len(&self, key: &str) -> Result<usize>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn remove(&self, key: &str) -> Result<bool>;

    /// Move `from` to `to`, overwriting `to`
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Drop every expired key now. Returns how many went away.
    fn purge_expired(&self) -> Result<usize>;
}

/// A single mutation, as recorded in the journal.
/// Values travel as JSON text since bincode cannot decode `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvsOp {
    Set { key: String, value: String },
    Expire { key: String, at_millis: i64 },
    HashSet { key: String, field: String, value: String },
    HashDel { key: String, field: String },
    ListAppend { key: String, value: String },
    ListPop { key: String },
    Remove { key: String },
    Rename { from: String, to: String },
}
