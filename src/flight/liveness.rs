use std::sync::Arc;
use std::time::Duration;
use crate::storage::pidfile::{process_alive, PidInfo};
use crate::tasks::{TaskDispatcher, TaskState};

/// Decides whether the producer named in a pidfile is still working
pub trait ProducerLiveness: Send + Sync {
    fn is_alive(&self, owner: &PidInfo) -> bool;
}

/// Alive while the operating system knows the pid
pub struct ProcessLiveness;

impl ProducerLiveness for ProcessLiveness {
    fn is_alive(&self, owner: &PidInfo) -> bool {
        process_alive(owner.pid)
    }
}

/// Producers running in this process are worker threads, so the pid alone
/// says nothing. They count as alive only while their task is pending or started.
pub struct TaskAwareLiveness {
    pub tasks: Arc<dyn TaskDispatcher>,
}

impl TaskAwareLiveness {
    pub fn new(tasks: Arc<dyn TaskDispatcher>) -> Self {
        TaskAwareLiveness { tasks }
    }
}

impl ProducerLiveness for TaskAwareLiveness {
    fn is_alive(&self, owner: &PidInfo) -> bool {
        if owner.pid != std::process::id() {
            return process_alive(owner.pid);
        }
        match self.tasks.async_result(&owner.task_id) {
            Some(result) => matches!(result.status(), TaskState::Pending | TaskState::Started),
            None => false,
        }
    }
}

/// When a claimed entry may be taken over by somebody else
#[derive(Clone)]
pub struct StalePolicy {
    pub grace: Duration,
    pub liveness: Arc<dyn ProducerLiveness>,
}

impl StalePolicy {
    pub fn new(grace: Duration, liveness: Arc<dyn ProducerLiveness>) -> Self {
        StalePolicy { grace, liveness }
    }

    /// Dead producer, or a pidfile older than the grace period
    pub fn is_stale(&self, owner: &PidInfo) -> bool {
        owner.age() >= self.grace || !self.liveness.is_alive(owner)
    }
}
