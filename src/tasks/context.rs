use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::core::error::{Error, ErrorKind, Result};

const RUNNING: u8 = 0;
const REVOKED: u8 = 1;
const HARD_TIMEOUT: u8 = 2;

/// Cooperative stop flag shared between a task and its dispatcher
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    pub state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn revoke(&self) {
        let _ = self.state.compare_exchange(RUNNING, REVOKED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn expire(&self) {
        let _ = self.state.compare_exchange(RUNNING, HARD_TIMEOUT, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    /// Error matching the reason of the stop, if stopped
    pub fn reason(&self) -> Option<Error> {
        match self.state.load(Ordering::SeqCst) {
            REVOKED => Some(Error::new(ErrorKind::Cancelled, "task was revoked".to_string())),
            HARD_TIMEOUT => Some(Error::new(ErrorKind::Timeout, "hard time limit exceeded".to_string())),
            _ => None,
        }
    }
}

/// Handed to every running task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub cancel: CancelToken,
    pub soft_deadline: Option<Instant>,
}

impl TaskContext {
    pub fn new(task_id: &str, cancel: CancelToken, soft_limit: Option<Duration>) -> Self {
        TaskContext {
            task_id: task_id.to_string(),
            cancel,
            soft_deadline: soft_limit.map(|limit| Instant::now() + limit),
        }
    }

    /// Context for work run outside the dispatcher
    pub fn detached(task_id: &str) -> Self {
        TaskContext::new(task_id, CancelToken::new(), None)
    }

    /// Called between units of work. Fails once the task was revoked,
    /// hit its hard limit, or ran past its soft limit.
    pub fn checkpoint(&self) -> Result<()> {
        if let Some(err) = self.cancel.reason() {
            return Err(err);
        }
        if let Some(deadline) = self.soft_deadline {
            if Instant::now() >= deadline {
                return Err(Error::new(ErrorKind::Timeout, "soft time limit exceeded".to_string()));
            }
        }
        Ok(())
    }
}
