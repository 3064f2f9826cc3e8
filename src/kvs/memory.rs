use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::core::error::{Error, ErrorKind, Result};
use crate::kvs::{KeyValueStore, KvsOp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Value(Value),
    Hash(BTreeMap<String, Value>),
    List(VecDeque<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub entry: Entry,
    pub expires_at: Option<i64>,    // Unix millis, wall clock
}

impl Slot {
    fn expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Mutations between two full sweeps of expired keys
const SWEEP_EVERY: u64 = 1024;

/// Process-local store; one lock makes every operation atomic.
/// Expired keys are dropped when touched and swept every `SWEEP_EVERY` writes.
pub struct MemoryKvs {
    pub slots: RwLock<HashMap<String, Slot>>,
    pub writes: AtomicU64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn wrong_type(key: &str, expected: &str) -> Error {
    Error::new(
        ErrorKind::BadInput,
        format!("key '{}' does not hold a {}", key, expected),
    )
}

fn live<'a>(slots: &'a HashMap<String, Slot>, key: &str, now: i64) -> Option<&'a Slot> {
    slots.get(key).filter(|slot| !slot.expired(now))
}

fn drop_expired(slots: &mut HashMap<String, Slot>, key: &str, now: i64) {
    if slots.get(key).is_some_and(|slot| slot.expired(now)) {
        slots.remove(key);
    }
}

/// Drop the key if it expired, then hand out the live slot
fn live_mut<'a>(slots: &'a mut HashMap<String, Slot>, key: &str, now: i64) -> Option<&'a mut Slot> {
    drop_expired(slots, key, now);
    slots.get_mut(key)
}

impl MemoryKvs {
    pub fn new() -> Self {
        MemoryKvs {
            slots: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Apply a journaled mutation. Returns the popped value for `ListPop`.
    pub fn apply(&self, op: &KvsOp) -> Result<Option<Value>> {
        let now = now_millis();
        let mut slots = self.slots.write();
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            slots.retain(|_, s| !s.expired(now));
        }

        match op {
            KvsOp::Set { key, value } => {
                let value: Value = serde_json::from_str(value)?;
                slots.insert(key.clone(), Slot { entry: Entry::Value(value), expires_at: None });
            }
            KvsOp::Expire { key, at_millis } => {
                if let Some(slot) = live_mut(&mut slots, key, now) {
                    slot.expires_at = Some(*at_millis);
                }
            }
            KvsOp::HashSet { key, field, value } => {
                let value: Value = serde_json::from_str(value)?;
                drop_expired(&mut slots, key, now);
                let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                    entry: Entry::Hash(BTreeMap::new()),
                    expires_at: None,
                });
                match &mut slot.entry {
                    Entry::Hash(map) => {
                        map.insert(field.clone(), value);
                    }
                    _ => return Err(wrong_type(key, "hash")),
                }
            }
            KvsOp::HashDel { key, field } => {
                let mut now_empty = false;
                let mut removed = None;
                if let Some(slot) = live_mut(&mut slots, key, now) {
                    match &mut slot.entry {
                        Entry::Hash(map) => {
                            removed = map.remove(field);
                            now_empty = map.is_empty();
                        }
                        _ => return Err(wrong_type(key, "hash")),
                    }
                }
                if now_empty {
                    slots.remove(key);
                }
                return Ok(removed);
            }
            KvsOp::ListAppend { key, value } => {
                let value: Value = serde_json::from_str(value)?;
                drop_expired(&mut slots, key, now);
                let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                    entry: Entry::List(VecDeque::new()),
                    expires_at: None,
                });
                match &mut slot.entry {
                    Entry::List(list) => list.push_back(value),
                    _ => return Err(wrong_type(key, "list")),
                }
            }
            KvsOp::ListPop { key } => {
                let mut now_empty = false;
                let mut popped = None;
                if let Some(slot) = live_mut(&mut slots, key, now) {
                    match &mut slot.entry {
                        Entry::List(list) => {
                            popped = list.pop_front();
                            now_empty = list.is_empty();
                        }
                        _ => return Err(wrong_type(key, "list")),
                    }
                }
                if now_empty {
                    slots.remove(key);
                }
                return Ok(popped);
            }
            KvsOp::Remove { key } => {
                return Ok(slots.remove(key).filter(|s| !s.expired(now)).map(|_| Value::Bool(true)));
            }
            KvsOp::Rename { from, to } => {
                let slot = match slots.remove(from) {
                    Some(slot) if !slot.expired(now) => slot,
                    _ => {
                        return Err(Error::new(ErrorKind::NotFound, format!("key '{}' not found", from)));
                    }
                };
                slots.insert(to.clone(), slot);
            }
        }
        Ok(None)
    }

    /// Live slots serialized for a snapshot: (key, entry JSON, expiry)
    pub fn export(&self) -> Result<Vec<(String, String, Option<i64>)>> {
        let now = now_millis();
        let slots = self.slots.read();
        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter().filter(|(_, s)| !s.expired(now)) {
            out.push((key.clone(), serde_json::to_string(&slot.entry)?, slot.expires_at));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn import(&self, rows: Vec<(String, String, Option<i64>)>) -> Result<()> {
        let mut slots = self.slots.write();
        slots.clear();
        for (key, entry, expires_at) in rows {
            let entry: Entry = serde_json::from_str(&entry)?;
            slots.insert(key, Slot { entry, expires_at });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        let now = now_millis();
        self.slots.read().values().filter(|s| !s.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKvs {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn set_op(key: &str, value: &Value) -> Result<KvsOp> {
    Ok(KvsOp::Set { key: key.to_string(), value: serde_json::to_string(value)? })
}

pub(crate) fn expire_op(key: &str, seconds: u64) -> KvsOp {
    KvsOp::Expire {
        key: key.to_string(),
        at_millis: now_millis().saturating_add((seconds as i64).saturating_mul(1000)),
    }
}

pub(crate) fn hash_set_op(key: &str, field: &str, value: &Value) -> Result<KvsOp> {
    Ok(KvsOp::HashSet {
        key: key.to_string(),
        field: field.to_string(),
        value: serde_json::to_string(value)?,
    })
}

pub(crate) fn list_append_op(key: &str, value: &Value) -> Result<KvsOp> {
    Ok(KvsOp::ListAppend { key: key.to_string(), value: serde_json::to_string(value)? })
}

impl KeyValueStore for MemoryKvs {
    fn set(&self, key: &str, value: &Value) -> Result<()> {
        self.apply(&set_op(key, value)?)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let slots = self.slots.read();
        match live(&slots, key, now_millis()) {
            None => Ok(None),
            Some(Slot { entry: Entry::Value(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key, "plain value")),
        }
    }

    fn set_ttl(&self, key: &str, seconds: u64) -> Result<()> {
        self.apply(&expire_op(key, seconds))?;
        Ok(())
    }

    fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = now_millis();
        let slots = self.slots.read();
        Ok(live(&slots, key, now)
            .and_then(|s| s.expires_at)
            .map(|at| ((at - now).max(0) as u64).div_ceil(1000)))
    }

    fn hash_set(&self, key: &str, field: &str, value: &Value) -> Result<()> {
        self.apply(&hash_set_op(key, field, value)?)?;
        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>> {
        let slots = self.slots.read();
        match live(&slots, key, now_millis()) {
            None => Ok(None),
            Some(Slot { entry: Entry::Hash(map), .. }) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, Value>> {
        let slots = self.slots.read();
        match live(&slots, key, now_millis()) {
            None => Ok(BTreeMap::new()),
            Some(Slot { entry: Entry::Hash(map), .. }) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    fn hash_del(&self, key: &str, field: &str) -> Result<bool> {
        let op = KvsOp::HashDel { key: key.to_string(), field: field.to_string() };
        Ok(self.apply(&op)?.is_some())
    }

    fn list_append(&self, key: &str, value: &Value) -> Result<usize> {
        self.apply(&list_append_op(key, value)?)?;
        self.list_len(key)
    }

    fn list_pop(&self, key: &str) -> Result<Option<Value>> {
        self.apply(&KvsOp::ListPop { key: key.to_string() })
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        let slots = self.slots.read();
        match live(&slots, key, now_millis()) {
            None => Ok(0),
            Some(Slot { entry: Entry::List(list), .. }) => Ok(list.len()),
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(live(&self.slots.read(), key, now_millis()).is_some())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.apply(&KvsOp::Remove { key: key.to_string() })?.is_some())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.apply(&KvsOp::Rename { from: from.to_string(), to: to.to_string() })?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_millis();
        let slots = self.slots.read();
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && !s.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = now_millis();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, s| !s.expired(now));
        Ok(before - slots.len())
    }
}
