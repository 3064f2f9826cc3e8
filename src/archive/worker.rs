use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use crate::archive::cold_store::ColdStore;
use crate::core::error::Result;
use crate::kvs::KeyValueStore;
use crate::query::chain::QueryChainRecord;
use crate::query::persistence::{read_hot, record_key, ARCHIVE_QUEUE_KEY};

/// Outcome of one archival pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub popped: usize,
    pub migrated: usize,
    pub requeued: usize,
    pub dropped: usize,      // Queued ids whose hot record is gone
    pub purged: usize,       // Cold rows past retention
    pub expired: usize,      // Hot keys swept after their TTL
}

/// Moves idle query chains from the KVS to the cold store and
/// enforces cold retention.
pub struct ArchivalWorker {
    pub kvs: Arc<dyn KeyValueStore>,
    pub cold: Arc<dyn ColdStore>,
    pub hot_ttl: chrono::Duration,
    pub cold_ttl: chrono::Duration,
    pub batch_size: usize,
}

impl ArchivalWorker {
    pub fn new(
        kvs: Arc<dyn KeyValueStore>,
        cold: Arc<dyn ColdStore>,
        hot_ttl_days: u32,
        cold_ttl_days: u32,
        batch_size: usize,
    ) -> Self {
        ArchivalWorker {
            kvs,
            cold,
            hot_ttl: chrono::Duration::days(hot_ttl_days as i64),
            cold_ttl: chrono::Duration::days(cold_ttl_days as i64),
            batch_size: batch_size.max(1),
        }
    }

    pub fn run_once(&self) -> Result<ArchiveReport> {
        self.run_once_at(Utc::now())
    }

    /// One pass as if the clock showed `now`
    pub fn run_once_at(&self, now: DateTime<Utc>) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();

        let mut popped = Vec::new();
        while popped.len() < self.batch_size {
            match self.kvs.list_pop(ARCHIVE_QUEUE_KEY)? {
                Some(Value::String(id)) => popped.push(id),
                Some(other) => warn!(value = %other, "ignoring malformed archive queue item"),
                None => break,
            }
        }
        report.popped = popped.len();

        let mut to_migrate: Vec<QueryChainRecord> = Vec::new();
        let mut keep = Vec::new();
        for id in &popped {
            match read_hot(self.kvs.as_ref(), id) {
                Ok(Some(mut record)) => {
                    if now - record.last_access_at >= self.hot_ttl {
                        record.archived = true;
                        to_migrate.push(record);
                    } else {
                        keep.push(id.clone());
                    }
                }
                Ok(None) => report.dropped += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "dropping unreadable record from archive queue");
                    report.dropped += 1;
                }
            }
        }

        if !to_migrate.is_empty() {
            if let Err(e) = self.cold.insert_batch(&to_migrate) {
                error!(error = %e, batch = to_migrate.len(), "cold store insert failed, re-queueing batch");
                let mut requeue = keep;
                requeue.extend(to_migrate.iter().map(|r| r.id.clone()));
                self.requeue(&requeue)?;
                return Err(e);
            }
            for record in &to_migrate {
                self.kvs.remove(&record_key(&record.id))?;
            }
            report.migrated = to_migrate.len();
        }

        self.requeue(&keep)?;
        report.requeued = keep.len();

        report.purged = self.cold.purge_older_than(now - self.cold_ttl)?;
        report.expired = self.kvs.purge_expired()?;

        if report.migrated > 0 || report.purged > 0 || report.expired > 0 {
            info!(
                migrated = report.migrated,
                purged = report.purged,
                requeued = report.requeued,
                dropped = report.dropped,
                expired = report.expired,
                "archival pass finished"
            );
        } else {
            debug!(popped = report.popped, "archival pass found nothing to do");
        }
        Ok(report)
    }

    fn requeue(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.kvs.list_append(ARCHIVE_QUEUE_KEY, &Value::String(id.clone()))?;
        }
        Ok(())
    }

    /// Run passes on a background thread every `interval`
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ArchivalHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("conc-archiver".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = self.run_once() {
                            error!(error = %e, "archival pass failed");
                        }
                    }
                    _ => break,
                }
            });

        match thread {
            Ok(handle) => ArchivalHandle { stop_tx, thread: Some(handle) },
            Err(e) => {
                error!(error = %e, "failed to start archival thread");
                ArchivalHandle { stop_tx, thread: None }
            }
        }
    }
}

/// Stops the background archiver when stopped or dropped
pub struct ArchivalHandle {
    pub stop_tx: Sender<()>,
    pub thread: Option<JoinHandle<()>>,
}

impl ArchivalHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ArchivalHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
