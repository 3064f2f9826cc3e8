use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::archive::cold_store::ColdStore;
use crate::archive::worker::{ArchivalHandle, ArchivalWorker, ArchiveReport};
use crate::cache::{CacheCleaner, CacheKey, CleanupReport, ConcCacheMap};
use crate::core::auth::Authenticator;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{CacheStats, CoreStats, HealthCheck, HealthCheckResult, HealthStatus};
use crate::core::types::UserId;
use crate::engine::{ConcLine, CorpusEngine};
use crate::flight::{Claim, FlightState, SingleFlight};
use crate::kvs::{JournaledKvs, KeyValueStore};
use crate::query::chain::{QueryChain, QueryChainRecord};
use crate::query::persistence::{QueryPersistence, ARCHIVE_QUEUE_KEY, RECORD_PREFIX};
use crate::service::builder::{calc_task_args, CALC_TASK};
use crate::service::status::{ComputationState, ComputationStatus, ErrorPayload};
use crate::storage::conc_file::read_range;
use crate::tasks::{TaskDispatcher, TaskLimits, TaskState, ThreadPoolDispatcher};

const TASK_KEY_PREFIX: &str = "conc_task:";
const HEALTH_PROBE_KEY: &str = "conc_health_probe";
const SLOW_CHECK: Duration = Duration::from_secs(1);

/// How long a reader waits for a failing task to record its error
const FAILURE_GRACE: Duration = Duration::from_millis(500);

fn task_key(chain_id: &str) -> String {
    format!("{}{}", TASK_KEY_PREFIX, chain_id)
}

/// Entry point of the core. Built by `CoreBuilder`; every operation is a
/// blocking call with an explicit or configured timeout.
pub struct ConcordanceService {
    pub config: Config,
    pub kvs: Arc<dyn KeyValueStore>,
    pub persistence: Arc<dyn QueryPersistence>,
    pub cold: Arc<dyn ColdStore>,
    pub engine: Arc<dyn CorpusEngine>,
    pub auth: Arc<dyn Authenticator>,
    pub map: Arc<ConcCacheMap>,
    pub flight: Arc<SingleFlight>,
    pub dispatcher: Arc<ThreadPoolDispatcher>,
    pub archiver: Arc<ArchivalWorker>,
    pub cleaner: CacheCleaner,
    pub journal: Option<Arc<JournaledKvs>>,
    pub(crate) archival_handle: Mutex<Option<ArchivalHandle>>,
    pub(crate) closed: AtomicBool,
    pub start_time: SystemTime,
}

impl ConcordanceService {
    // ---- Query chains ----

    pub fn submit_chain(&self, user_id: UserId, chain: &QueryChain) -> Result<String> {
        chain.validate()?;
        self.persistence.store(user_id, chain, None)
    }

    /// Store `chain` as the successor of `prev_id`. An unchanged chain keeps the previous id.
    pub fn submit_chain_after(&self, user_id: UserId, chain: &QueryChain, prev_id: &str) -> Result<String> {
        chain.validate()?;
        let prev = self.get_chain(prev_id)?;
        self.persistence.store(user_id, chain, Some(&prev))
    }

    pub fn get_chain(&self, chain_id: &str) -> Result<QueryChainRecord> {
        if !self.persistence.is_valid_id(chain_id) {
            return Err(Error::new(ErrorKind::BadInput, format!("malformed chain id '{}'", chain_id)));
        }
        self.persistence
            .open(chain_id)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("query chain {} not found", chain_id)))
    }

    // ---- Computation ----

    /// Make sure a computation for the chain exists and return the id of
    /// the task that produces (or produced) it. Identical chains share one task.
    pub fn start_computation(&self, chain_id: &str) -> Result<String> {
        let record = self.get_chain(chain_id)?;
        let key = CacheKey::from_chain(&record.data)?;
        let task_id = Uuid::new_v4().to_string();

        // reserved first so the claim below is seen as live by other callers
        let args = calc_task_args(chain_id, &record.data)?;
        self.dispatcher.reserve(&task_id, CALC_TASK, args, TaskLimits::default())?;
        let claim = match self.flight.claim(&key, &task_id) {
            Ok(claim) => claim,
            Err(e) => {
                self.dispatcher.discard_reserved(&task_id);
                return Err(e);
            }
        };

        match claim {
            Claim::Ready { size, .. } => {
                self.dispatcher.discard_reserved(&task_id);
                let known = match self.map.get_entry(&key)?.and_then(|e| e.task_id) {
                    Some(id) => Some(id),
                    None => self.task_of(chain_id)?,
                };
                let id = known.unwrap_or(task_id);
                self.remember_task(chain_id, &id)?;
                debug!(chain_id, size, "concordance already cached");
                Ok(id)
            }
            Claim::Reader { owner, .. } => {
                self.dispatcher.discard_reserved(&task_id);
                self.remember_task(chain_id, &owner.task_id)?;
                debug!(chain_id, task_id = %owner.task_id, "joined running computation");
                Ok(owner.task_id)
            }
            Claim::Producer { reclaimed, .. } => {
                let sent = self
                    .remember_task(chain_id, &task_id)
                    .and_then(|_| self.dispatcher.submit_reserved(&task_id));
                if let Err(e) = sent {
                    self.dispatcher.discard_reserved(&task_id);
                    if let Err(cleanup) = self.flight.abandon(&key, &task_id) {
                        warn!(key = %key, error = %cleanup, "failed to release claim after dispatch error");
                    }
                    return Err(e);
                }
                info!(chain_id, task_id = %task_id, reclaimed, "computation scheduled");
                Ok(task_id)
            }
        }
    }

    pub fn poll_computation(&self, chain_id: &str) -> Result<ComputationStatus> {
        let record = self.get_chain(chain_id)?;
        let key = CacheKey::from_chain(&record.data)?;
        let task_id = self.task_of(chain_id)?;

        let mut status = ComputationStatus {
            task_id: task_id.clone(),
            ..ComputationStatus::not_started()
        };

        let entry = self.map.get_entry(&key)?;
        if let Some(entry) = &entry {
            status.current_size = entry.size_seen;
            if entry.complete {
                status.state = ComputationState::Success;
                status.total_size = Some(entry.size_seen);
                return Ok(status);
            }
        }

        let task = task_id.as_deref().and_then(|id| self.dispatcher.async_result(id));
        let task_state = task.as_ref().map(|t| t.status());
        status.state = match task_state {
            Some(TaskState::Failure) => {
                status.error = task.and_then(|t| t.error()).map(|e| self.payload(chain_id, &e));
                ComputationState::Failure
            }
            Some(TaskState::Pending) if entry.is_some() => ComputationState::Pending,
            Some(TaskState::Started) => ComputationState::Started,
            _ => match self.flight.state(&key)? {
                FlightState::Claimed(_) => ComputationState::Started,
                _ => ComputationState::NotStarted,
            },
        };
        Ok(status)
    }

    /// Lines `offset..offset + limit`, waiting up to the configured timeout
    pub fn read_lines(&self, chain_id: &str, offset: u64, limit: u64) -> Result<Vec<ConcLine>> {
        self.read_lines_timeout(chain_id, offset, limit, self.config.read_wait_timeout())
    }

    /// Blocks until the requested lines are published or the producer
    /// finishes. Fewer lines come back only when the result is shorter.
    pub fn read_lines_timeout(&self, chain_id: &str, offset: u64, limit: u64, timeout: Duration) -> Result<Vec<ConcLine>> {
        let record = self.get_chain(chain_id)?;
        let key = CacheKey::from_chain(&record.data)?;

        let Some(entry) = self.map.get_entry(&key)? else {
            return Err(self.task_failure(chain_id)?.unwrap_or_else(|| {
                Error::new(ErrorKind::NotFound, format!("no computation for chain {}", chain_id))
            }));
        };

        let size = if entry.complete {
            if let Err(e) = self.map.touch(&key) {
                warn!(key = %key, error = %e, "failed to record cache access");
            }
            entry.size_seen
        } else {
            match self.flight.attach(&key, offset.saturating_add(limit), Some(timeout)) {
                Ok(outcome) => outcome.size(),
                Err(e) if e.kind == ErrorKind::ConcCalculationFailed => {
                    return Err(self.task_failure(chain_id)?.unwrap_or(e));
                }
                Err(e) => return Err(e),
            }
        };

        let path = self
            .map
            .cache_file_path(&key)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("cache file of chain {} is gone", chain_id)))?;
        read_range(&path, offset, limit, size)
    }

    /// Stop the task computing the chain. The cache entry is dropped at once
    /// so the next start computes afresh.
    pub fn cancel_computation(&self, chain_id: &str) -> Result<bool> {
        let Some(task_id) = self.task_of(chain_id)? else { return Ok(false) };
        let revoked = self.dispatcher.control().revoke(&task_id, true);
        if revoked {
            let record = self.get_chain(chain_id)?;
            let key = CacheKey::from_chain(&record.data)?;
            self.flight.abandon(&key, &task_id)?;
            info!(chain_id, task_id = %task_id, "computation cancelled");
        }
        Ok(revoked)
    }

    /// Drop the cached result of the chain and every derived result.
    /// Only the chain's owner may do so.
    pub fn invalidate(&self, user_id: UserId, chain_id: &str) -> Result<usize> {
        let record = self.get_chain(chain_id)?;
        if record.user_id != user_id {
            return Err(Error::new(
                ErrorKind::Forbidden,
                format!("user {} does not own chain {}", user_id.0, chain_id),
            ));
        }

        let own_task = self.task_of(chain_id)?;
        if let Some(task_id) = &own_task {
            self.dispatcher.control().revoke(task_id, true);
            self.kvs.remove(&task_key(chain_id))?;
        }
        // a live producer started for another chain keeps its entry
        let key = CacheKey::from_chain(&record.data)?;
        let removed = self.map.del_full_entry_sparing(&key, |owner| {
            own_task.as_deref() != Some(owner.task_id.as_str()) && !self.flight.policy.is_stale(owner)
        })?;
        info!(chain_id, removed, "cache invalidated");
        Ok(removed)
    }

    // ---- Lifecycle ----

    pub fn archive(&self, user_id: UserId, chain_id: &str, revoke: bool) -> Result<(usize, QueryChainRecord)> {
        self.persistence.archive(user_id, chain_id, revoke)
    }

    pub fn run_archival(&self) -> Result<ArchiveReport> {
        self.archiver.run_once()
    }

    pub fn cleanup_cache(&self) -> Result<CleanupReport> {
        self.cleaner.run()
    }

    // ---- Monitoring ----

    pub fn stats(&self) -> Result<CoreStats> {
        let mut cache = CacheStats::default();
        for corpname in self.map.corpora()? {
            cache.corpora += 1;
            for (_, entry) in self.map.entries(&corpname)? {
                cache.entries += 1;
                if entry.complete {
                    cache.complete_entries += 1;
                }
                if entry.is_claimed() {
                    cache.in_flight += 1;
                }
                cache.total_bytes += fs::metadata(self.map.entry_path(&corpname, &entry))
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
        }

        Ok(CoreStats {
            uptime_secs: self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            start_time: self.start_time,
            cache,
            tasks: self.dispatcher.stats(),
            hot_records: self.kvs.keys_with_prefix(RECORD_PREFIX)?.len(),
            archive_queue_len: self.kvs.list_len(ARCHIVE_QUEUE_KEY)?,
            archived_records: self.cold.count()?,
        })
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let checks = vec![
            probe("kvs", || {
                self.kvs.set(HEALTH_PROBE_KEY, &Value::Bool(true))?;
                let seen = self.kvs.get(HEALTH_PROBE_KEY)?;
                self.kvs.remove(HEALTH_PROBE_KEY)?;
                match seen {
                    Some(Value::Bool(true)) => Ok(()),
                    _ => Err(Error::new(ErrorKind::StorageUnavailable, "probe value lost".to_string())),
                }
            }),
            probe("cache_dir", || {
                let path = self.config.cache_dir.join(".health_probe");
                fs::write(&path, b"ok")?;
                fs::remove_file(&path)?;
                Ok(())
            }),
            probe("cold_store", || self.cold.count().map(|_| ())),
            probe("dispatcher", || {
                if self.dispatcher.is_running() {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::Internal, "task dispatcher is shut down".to_string()))
                }
            }),
        ];
        HealthCheckResult::from_checks(checks)
    }

    /// Stop background threads and flush the journal. Safe to call twice.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut handle) = self.archival_handle.lock().take() {
            handle.stop();
        }
        self.dispatcher.shutdown();
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.checkpoint() {
                warn!(error = %e, "KVS checkpoint on shutdown failed");
            }
        }
        info!("concordance service stopped");
    }

    // ---- Helpers ----

    fn remember_task(&self, chain_id: &str, task_id: &str) -> Result<()> {
        let key = task_key(chain_id);
        self.kvs.set(&key, &Value::String(task_id.to_string()))?;
        self.kvs.set_ttl(&key, self.config.task_record_ttl_secs)
    }

    fn task_of(&self, chain_id: &str) -> Result<Option<String>> {
        Ok(self
            .kvs
            .get(&task_key(chain_id))?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Error of the chain's task, giving a failing task a moment to finish
    fn task_failure(&self, chain_id: &str) -> Result<Option<Error>> {
        let Some(task_id) = self.task_of(chain_id)? else { return Ok(None) };
        let Some(task) = self.dispatcher.async_result(&task_id) else { return Ok(None) };
        let _ = task.get(Some(FAILURE_GRACE));
        Ok(task.error())
    }

    fn payload(&self, chain_id: &str, err: &Error) -> ErrorPayload {
        let payload = ErrorPayload::from(err);
        debug!(chain_id, correlation_id = %payload.correlation_id, error = %err, "reporting computation failure");
        payload
    }
}

fn probe<F>(name: &str, check: F) -> HealthCheck
where
    F: FnOnce() -> Result<()>,
{
    let started = Instant::now();
    let outcome = check();
    let elapsed = started.elapsed();

    let (status, message) = match outcome {
        Err(e) => (HealthStatus::Unhealthy(e.to_string()), Some(e.to_string())),
        Ok(()) if elapsed > SLOW_CHECK => {
            let msg = format!("took {} ms", elapsed.as_millis());
            (HealthStatus::Degraded(msg.clone()), Some(msg))
        }
        Ok(()) => (HealthStatus::Healthy, None),
    };
    HealthCheck {
        name: name.to_string(),
        status,
        message,
        latency_ms: elapsed.as_millis() as u64,
    }
}

impl Drop for ConcordanceService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
