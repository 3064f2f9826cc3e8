use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::cache::key::CacheKey;
use crate::cache::map::{ConcCacheMap, Registration};
use crate::core::error::{Error, ErrorKind, Result};
use crate::flight::liveness::StalePolicy;
use crate::storage::conc_file::ConcFileWriter;
use crate::storage::pidfile::{PidFile, PidInfo, PidState};

/// Where a key stands right now
#[derive(Debug, Clone, PartialEq)]
pub enum FlightState {
    Absent,
    Claimed(PidInfo),
    Ready { size: u64 },
}

/// Outcome of `claim`
#[derive(Debug, Clone)]
pub enum Claim {
    Producer {
        conc_path: PathBuf,
        pid_path: PathBuf,
        reclaimed: bool,
    },
    Reader {
        conc_path: PathBuf,
        owner: PidInfo,
    },
    Ready {
        conc_path: PathBuf,
        size: u64,
    },
}

/// How a reader's wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Enough lines are published, the producer is still running
    Reached { size: u64 },
    /// The producer finished; `size` is final
    Finished { size: u64 },
}

impl WaitOutcome {
    pub fn size(&self) -> u64 {
        match self {
            WaitOutcome::Reached { size } | WaitOutcome::Finished { size } => *size,
        }
    }
}

/// At most one producer per cache key; everybody else reads what it publishes
pub struct SingleFlight {
    pub map: Arc<ConcCacheMap>,
    pub policy: StalePolicy,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl SingleFlight {
    pub fn new(map: Arc<ConcCacheMap>, policy: StalePolicy, backoff: (Duration, Duration)) -> Self {
        SingleFlight {
            map,
            policy,
            backoff_min: backoff.0,
            backoff_max: backoff.1.max(backoff.0),
        }
    }

    pub fn state(&self, key: &CacheKey) -> Result<FlightState> {
        let Some(entry) = self.map.get_entry(key)? else { return Ok(FlightState::Absent) };
        if let Some(pid_name) = &entry.pid_file {
            let pid_path = self.map.layout.corpus_dir(&key.corpname).join(pid_name);
            if let PidState::Present(owner) = PidFile::read(&pid_path)? {
                return Ok(FlightState::Claimed(owner));
            }
        }
        Ok(if entry.complete {
            FlightState::Ready { size: entry.size_seen }
        } else {
            FlightState::Absent
        })
    }

    pub fn claim(&self, key: &CacheKey, task_id: &str) -> Result<Claim> {
        let claimant = PidInfo::current(task_id);
        Ok(match self.map.register(key, &claimant, &self.policy)? {
            Registration::Producer { conc_path, pid_path, reclaimed } => {
                info!(key = %key, task_id, reclaimed, "became producer");
                Claim::Producer { conc_path, pid_path, reclaimed }
            }
            Registration::Reader { conc_path, owner, .. } => {
                debug!(key = %key, owner_task = %owner.task_id, "attaching to running producer");
                Claim::Reader { conc_path, owner }
            }
            Registration::Ready { conc_path, entry } => Claim::Ready { conc_path, size: entry.size_seen },
        })
    }

    /// Progress of an owned entry
    pub fn publish(&self, key: &CacheKey, task_id: &str, size: u64) -> Result<u64> {
        self.map.publish(key, size, task_id, false)
    }

    /// Final size, then the pidfile goes away
    pub fn complete(&self, key: &CacheKey, task_id: &str, size: u64) -> Result<()> {
        self.map.publish(key, size, task_id, true)?;
        self.map.release(key, task_id)?;
        debug!(key = %key, task_id, size, "producer finished");
        Ok(())
    }

    /// Writer on the owned entry's file; `Cancelled` once ownership is lost
    pub fn writer(&self, key: &CacheKey, task_id: &str) -> Result<ConcFileWriter> {
        let (path, file) = self.map.open_owned(key, task_id)?;
        Ok(ConcFileWriter::from_file(&path, file))
    }

    pub fn abandon(&self, key: &CacheKey, task_id: &str) -> Result<bool> {
        self.map.abandon(key, task_id)
    }

    /// Wait until at least `min_size` lines are published or the producer
    /// finishes. A producer that vanishes without completing, or goes stale,
    /// fails the wait with `ConcCalculationFailed`.
    pub fn attach(&self, key: &CacheKey, min_size: u64, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut delay = self.backoff_min;

        loop {
            let entry = self.map.get_entry(key)?.ok_or_else(|| failed(key, "cache entry disappeared"))?;
            if entry.complete {
                return Ok(WaitOutcome::Finished { size: entry.size_seen });
            }
            if entry.size_seen >= min_size {
                return Ok(WaitOutcome::Reached { size: entry.size_seen });
            }

            let pid_path = entry
                .pid_file
                .as_ref()
                .map(|name| self.map.layout.corpus_dir(&key.corpname).join(name))
                .ok_or_else(|| failed(key, "producer left an incomplete result"))?;

            match PidFile::read(&pid_path)? {
                PidState::Present(owner) if self.policy.is_stale(&owner) => {
                    warn!(key = %key, owner_task = %owner.task_id, "producer went stale");
                    self.map.invalidate_stale(key, &owner)?;
                    return Err(failed(key, "producer is gone"));
                }
                PidState::Present(_) => {}
                _ => {
                    // completion is published before the pidfile goes away
                    return match self.map.get_entry(key)? {
                        Some(entry) if entry.complete => Ok(WaitOutcome::Finished { size: entry.size_seen }),
                        _ => Err(failed(key, "producer stopped without completing")),
                    };
                }
            }

            let mut pause = delay;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::new(
                        ErrorKind::Timeout,
                        format!("gave up waiting for {} lines of {}", min_size, key),
                    ));
                }
                pause = pause.min(deadline - now);
            }
            thread::sleep(pause);
            delay = (delay * 2).min(self.backoff_max);
        }
    }
}

fn failed(key: &CacheKey, reason: &str) -> Error {
    Error::new(ErrorKind::ConcCalculationFailed, format!("{}: {}", key, reason))
}
