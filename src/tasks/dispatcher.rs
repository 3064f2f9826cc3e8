use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use chrono::Utc;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};
use crate::tasks::context::{CancelToken, TaskContext};
use crate::tasks::record::{TaskArgs, TaskLimits, TaskRecord, TaskState};

const WATCHDOG_TICK: Duration = Duration::from_millis(25);

/// A named unit of background work
pub type TaskHandler = Arc<dyn Fn(&TaskContext, &TaskArgs) -> Result<Value> + Send + Sync>;

/// Background task dispatch. Errors coming back from workers always carry
/// one of the crate's own error kinds.
pub trait TaskDispatcher: Send + Sync {
    fn send_task(&self, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<ResultWrapper>;

    /// Same as `send_task` with a caller-chosen id
    fn send_task_with_id(&self, task_id: &str, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<ResultWrapper>;

    /// Handle for a known task
    fn async_result(&self, task_id: &str) -> Option<ResultWrapper>;

    fn control(&self) -> Control;

    fn get_task_error(&self, task_id: &str) -> Option<Error>;

    fn stats(&self) -> DispatcherStats;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub workers: usize,
    pub submitted: u64,
    pub pending: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub running: usize,     // Handlers executing right now, revoked ones included
}

struct TaskSlot {
    record: TaskRecord,
    cancel: CancelToken,
    hard_deadline: Option<Instant>,
}

/// Shared task bookkeeping; `finished` is signalled on every terminal transition
pub struct TaskTable {
    slots: Mutex<HashMap<String, TaskSlot>>,
    finished: Condvar,
}

impl TaskTable {
    fn new() -> Self {
        TaskTable {
            slots: Mutex::new(HashMap::new()),
            finished: Condvar::new(),
        }
    }

    fn record(&self, task_id: &str) -> Option<TaskRecord> {
        self.slots.lock().get(task_id).map(|slot| slot.record.clone())
    }

    /// Terminal transition, first writer wins
    fn finish(&self, task_id: &str, outcome: Result<Value>) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(task_id) else { return false };
        if slot.record.state.is_finished() {
            return false;
        }
        match outcome {
            Ok(value) => slot.record.succeed(value),
            Err(err) => slot.record.fail(err),
        }
        self.finished.notify_all();
        true
    }
}

/// Caller-side handle of a task
#[derive(Clone)]
pub struct ResultWrapper {
    pub id: String,
    table: Arc<TaskTable>,
}

impl std::fmt::Debug for ResultWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultWrapper").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ResultWrapper {
    /// Unknown (e.g. expired) tasks report `Pending`
    pub fn status(&self) -> TaskState {
        self.table
            .record(&self.id)
            .map(|r| r.state)
            .unwrap_or(TaskState::Pending)
    }

    pub fn record(&self) -> Option<TaskRecord> {
        self.table.record(&self.id)
    }

    pub fn error(&self) -> Option<Error> {
        self.table.record(&self.id).and_then(|r| r.error)
    }

    /// Block until the task finishes. `None` waits without limit.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slots = self.table.slots.lock();
        loop {
            match slots.get(&self.id) {
                Some(slot) if slot.record.state == TaskState::Success => {
                    return Ok(slot.record.result.clone().unwrap_or(Value::Null));
                }
                Some(slot) if slot.record.state == TaskState::Failure => {
                    return Err(slot.record.error.clone().unwrap_or_else(|| {
                        Error::new(ErrorKind::Internal, format!("task {} failed", self.id))
                    }));
                }
                Some(_) => {}
                None => {
                    return Err(Error::new(ErrorKind::NotFound, format!("unknown task {}", self.id)));
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self.table.finished.wait_until(&mut slots, deadline).timed_out()
                    {
                        // one more look in case the wakeup raced the deadline
                        if let Some(slot) = slots.get(&self.id) {
                            if slot.record.state.is_finished() {
                                continue;
                            }
                        }
                        return Err(Error::new(
                            ErrorKind::Timeout,
                            format!("task {} did not finish in time", self.id),
                        ));
                    }
                }
                None => self.table.finished.wait(&mut slots),
            }
        }
    }
}

/// Remote control over running and queued tasks
#[derive(Clone)]
pub struct Control {
    table: Arc<TaskTable>,
}

impl Control {
    /// Pending tasks never run. Started tasks are only stopped with
    /// `terminate`; they are failed at once and asked to stop cooperatively.
    pub fn revoke(&self, task_id: &str, terminate: bool) -> bool {
        let mut slots = self.table.slots.lock();
        let Some(slot) = slots.get_mut(task_id) else { return false };
        let revocable = match slot.record.state {
            TaskState::Pending => true,
            TaskState::Started => terminate,
            TaskState::Success | TaskState::Failure => false,
        };
        if !revocable {
            return false;
        }

        slot.cancel.revoke();
        slot.record.fail(Error::new(ErrorKind::Cancelled, format!("task {} was revoked", task_id)));
        self.table.finished.notify_all();
        info!(task_id, terminate, "task revoked");
        true
    }
}

struct Job {
    task_id: String,
}

/// Worker threads fed from a crossbeam channel plus a watchdog thread
/// enforcing hard time limits and expiring old task records.
pub struct ThreadPoolDispatcher {
    table: Arc<TaskTable>,
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    watchdog: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    worker_count: usize,
    submitted: AtomicU64,
    running: Arc<AtomicUsize>,
    pub default_limits: TaskLimits,
}

impl ThreadPoolDispatcher {
    pub fn new(workers: usize, default_limits: TaskLimits, record_ttl: Duration) -> Result<Self> {
        let workers = workers.max(1);
        let table = Arc::new(TaskTable::new());
        let handlers: Arc<RwLock<HashMap<String, TaskHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let (sender, receiver) = unbounded::<Job>();
        let running = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::with_capacity(workers);
        for n in 0..workers {
            let receiver = receiver.clone();
            let table = table.clone();
            let handlers = handlers.clone();
            let running = running.clone();
            let thread = thread::Builder::new()
                .name(format!("conc-worker-{}", n))
                .spawn(move || Self::worker_loop(receiver, table, handlers, running))?;
            threads.push(thread);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let watchdog_table = table.clone();
        let watchdog = thread::Builder::new()
            .name("conc-watchdog".to_string())
            .spawn(move || Self::watchdog_loop(stop_rx, watchdog_table, record_ttl))?;

        info!(workers, "task dispatcher started");
        Ok(ThreadPoolDispatcher {
            table,
            handlers,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(threads),
            watchdog: Mutex::new(Some((stop_tx, watchdog))),
            worker_count: workers,
            submitted: AtomicU64::new(0),
            running,
            default_limits,
        })
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&TaskContext, &TaskArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.to_string(), Arc::new(handler));
    }

    fn worker_loop(
        receiver: Receiver<Job>,
        table: Arc<TaskTable>,
        handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
        running: Arc<AtomicUsize>,
    ) {
        while let Ok(job) = receiver.recv() {
            let started = {
                let mut slots = table.slots.lock();
                match slots.get_mut(&job.task_id) {
                    Some(slot) if slot.record.state == TaskState::Pending => {
                        slot.record.state = TaskState::Started;
                        slot.record.started_at = Some(Utc::now());
                        slot.hard_deadline = slot.record.limits.hard.map(|h| Instant::now() + h);
                        Some((
                            slot.record.name.clone(),
                            slot.record.args.clone(),
                            TaskContext::new(&job.task_id, slot.cancel.clone(), slot.record.limits.soft),
                        ))
                    }
                    // revoked while queued
                    _ => None,
                }
            };
            let Some((name, args, ctx)) = started else { continue };

            let handler = handlers.read().get(&name).cloned();
            running.fetch_add(1, Ordering::SeqCst);
            let outcome = match handler {
                Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&ctx, &args))) {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(task_id = %job.task_id, task = %name, panic = %msg, "task panicked");
                        Err(Error::new(ErrorKind::Internal, format!("task panicked: {}", msg)))
                    }
                },
                None => Err(Error::new(ErrorKind::BadInput, format!("no handler registered for '{}'", name))),
            };
            running.fetch_sub(1, Ordering::SeqCst);

            match &outcome {
                Ok(_) => debug!(task_id = %job.task_id, task = %name, "task succeeded"),
                Err(e) => warn!(task_id = %job.task_id, task = %name, error = %e, "task failed"),
            }
            table.finish(&job.task_id, outcome);
        }
    }

    fn watchdog_loop(stop: Receiver<()>, table: Arc<TaskTable>, record_ttl: Duration) {
        let ttl = chrono::Duration::from_std(record_ttl).unwrap_or(chrono::Duration::MAX);
        loop {
            match stop.recv_timeout(WATCHDOG_TICK) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }

            let now = Instant::now();
            let mut slots = table.slots.lock();
            let mut expired = false;
            for (task_id, slot) in slots.iter_mut() {
                let over = slot.record.state == TaskState::Started
                    && slot.hard_deadline.is_some_and(|deadline| now >= deadline);
                if over {
                    slot.cancel.expire();
                    slot.record.fail(Error::new(
                        ErrorKind::Timeout,
                        format!("task {} exceeded its hard time limit", task_id),
                    ));
                    warn!(task_id = %task_id, "hard time limit exceeded");
                    expired = true;
                }
            }
            if expired {
                table.finished.notify_all();
            }

            let cutoff = Utc::now() - ttl;
            slots.retain(|_, slot| !slot.record.finished_at.is_some_and(|at| at < cutoff));
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Fail queued tasks, stop running ones and join every thread
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        {
            let mut slots = self.table.slots.lock();
            for slot in slots.values_mut() {
                if !slot.record.state.is_finished() {
                    slot.cancel.revoke();
                    slot.record.fail(Error::new(ErrorKind::Cancelled, "dispatcher shut down".to_string()));
                }
            }
            self.table.finished.notify_all();
        }

        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        if let Some((stop_tx, watchdog)) = self.watchdog.lock().take() {
            let _ = stop_tx.send(());
            let _ = watchdog.join();
        }
        // handlers may hold an Arc back to this dispatcher
        self.handlers.write().clear();
        info!("task dispatcher stopped");
    }

    fn enqueue(&self, task_id: String, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<ResultWrapper> {
        self.reserve(&task_id, name, args, limits)?;
        self.submit_reserved(&task_id)
    }

    /// Register a task without queueing it. Until it is submitted or
    /// discarded it reports `Pending`, so claims made on its behalf count as live.
    pub fn reserve(&self, task_id: &str, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<()> {
        if !self.handlers.read().contains_key(name) {
            return Err(Error::new(ErrorKind::BadInput, format!("unknown task '{}'", name)));
        }

        let mut slots = self.table.slots.lock();
        if slots.contains_key(task_id) {
            return Err(Error::new(ErrorKind::BadInput, format!("task id {} already in use", task_id)));
        }
        slots.insert(
            task_id.to_string(),
            TaskSlot {
                record: TaskRecord::new(task_id.to_string(), name.to_string(), args, limits.or(self.default_limits)),
                cancel: CancelToken::new(),
                hard_deadline: None,
            },
        );
        Ok(())
    }

    pub fn submit_reserved(&self, task_id: &str) -> Result<ResultWrapper> {
        let name = self
            .table
            .record(task_id)
            .map(|r| r.name)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("task {} was not reserved", task_id)))?;

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Job { task_id: task_id.to_string() }).is_ok(),
            None => false,
        };
        if !sent {
            self.table.slots.lock().remove(task_id);
            return Err(Error::new(ErrorKind::Internal, "task dispatcher is shut down".to_string()));
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task_id, task = %name, "task queued");
        Ok(ResultWrapper { id: task_id.to_string(), table: self.table.clone() })
    }

    /// Forget a reserved task that was never submitted
    pub fn discard_reserved(&self, task_id: &str) -> bool {
        let mut slots = self.table.slots.lock();
        match slots.get(task_id) {
            Some(slot) if slot.record.state == TaskState::Pending => {
                slots.remove(task_id);
                true
            }
            _ => false,
        }
    }
}

impl TaskDispatcher for ThreadPoolDispatcher {
    fn send_task(&self, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<ResultWrapper> {
        self.enqueue(Uuid::new_v4().to_string(), name, args, limits)
    }

    fn send_task_with_id(&self, task_id: &str, name: &str, args: TaskArgs, limits: TaskLimits) -> Result<ResultWrapper> {
        self.enqueue(task_id.to_string(), name, args, limits)
    }

    fn async_result(&self, task_id: &str) -> Option<ResultWrapper> {
        self.table
            .slots
            .lock()
            .contains_key(task_id)
            .then(|| ResultWrapper { id: task_id.to_string(), table: self.table.clone() })
    }

    fn control(&self) -> Control {
        Control { table: self.table.clone() }
    }

    fn get_task_error(&self, task_id: &str) -> Option<Error> {
        self.table.record(task_id).and_then(|r| r.error)
    }

    fn stats(&self) -> DispatcherStats {
        let slots = self.table.slots.lock();
        let mut stats = DispatcherStats {
            workers: self.worker_count,
            submitted: self.submitted.load(Ordering::Relaxed),
            running: self.running.load(Ordering::SeqCst),
            ..Default::default()
        };
        for slot in slots.values() {
            match slot.record.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Started => stats.started += 1,
                TaskState::Success => stats.succeeded += 1,
                TaskState::Failure => stats.failed += 1,
            }
        }
        stats
    }
}

impl Drop for ThreadPoolDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher(workers: usize) -> ThreadPoolDispatcher {
        let d = ThreadPoolDispatcher::new(workers, TaskLimits::default(), Duration::from_secs(60)).unwrap();
        d.register("echo", |_ctx, args| Ok(args.get("value", 0).cloned().unwrap_or(Value::Null)));
        d.register("fail", |_ctx, _args| Err(Error::new(ErrorKind::BadInput, "nope".to_string())));
        d.register("panic", |_ctx, _args| panic!("boom"));
        d.register("spin", |ctx, _args| loop {
            ctx.checkpoint()?;
            thread::sleep(Duration::from_millis(2));
        });
        d
    }

    #[test]
    fn test_success_and_failure() {
        let d = dispatcher(2);
        let ok = d.send_task("echo", TaskArgs::keyword(&[("value", json!(7))]), TaskLimits::default()).unwrap();
        assert_eq!(ok.get(Some(Duration::from_secs(5))).unwrap(), json!(7));
        assert_eq!(ok.status(), TaskState::Success);

        let bad = d.send_task("fail", TaskArgs::Positional(vec![]), TaskLimits::default()).unwrap();
        assert_eq!(bad.get(Some(Duration::from_secs(5))).unwrap_err().kind, ErrorKind::BadInput);
        assert_eq!(d.get_task_error(&bad.id).unwrap().kind, ErrorKind::BadInput);
    }

    #[test]
    fn test_panic_becomes_internal() {
        let d = dispatcher(1);
        let r = d.send_task("panic", TaskArgs::Positional(vec![]), TaskLimits::default()).unwrap();
        let err = r.get(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.context.contains("boom"));

        // the worker survives
        let ok = d.send_task("echo", TaskArgs::Positional(vec![json!(1)]), TaskLimits::default()).unwrap();
        assert_eq!(ok.get(Some(Duration::from_secs(5))).unwrap(), json!(1));
    }

    #[test]
    fn test_unknown_task_rejected() {
        let d = dispatcher(1);
        let err = d.send_task("missing", TaskArgs::Positional(vec![]), TaskLimits::default()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn test_revoke_running_with_terminate() {
        let d = dispatcher(1);
        let r = d.send_task("spin", TaskArgs::Positional(vec![]), TaskLimits::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while r.status() != TaskState::Started && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        assert!(!d.control().revoke(&r.id, false));
        assert_eq!(r.status(), TaskState::Started);
        assert_eq!(d.stats().running, 1);
        assert!(d.control().revoke(&r.id, true));
        assert_eq!(r.status(), TaskState::Failure);
        assert_eq!(r.get(Some(Duration::from_secs(1))).unwrap_err().kind, ErrorKind::Cancelled);

        // the handler notices the revocation at its next checkpoint
        while d.stats().running > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(d.stats().running, 0);
    }

    #[test]
    fn test_revoke_pending_never_runs() {
        let d = dispatcher(1);
        let blocker = d.send_task("spin", TaskArgs::Positional(vec![]), TaskLimits::default()).unwrap();
        let queued = d.send_task_with_id("q1", "echo", TaskArgs::Positional(vec![json!(1)]), TaskLimits::default()).unwrap();

        assert!(d.control().revoke("q1", false));
        d.control().revoke(&blocker.id, true);
        assert_eq!(queued.get(Some(Duration::from_secs(5))).unwrap_err().kind, ErrorKind::Cancelled);
        assert!(queued.record().unwrap().started_at.is_none());
    }

    #[test]
    fn test_hard_limit() {
        let d = dispatcher(1);
        let limits = TaskLimits { soft: None, hard: Some(Duration::from_millis(50)) };
        let r = d.send_task("spin", TaskArgs::Positional(vec![]), limits).unwrap();
        assert_eq!(r.get(Some(Duration::from_secs(5))).unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_soft_limit_surfaces_in_task() {
        let d = dispatcher(1);
        let limits = TaskLimits { soft: Some(Duration::from_millis(20)), hard: None };
        let r = d.send_task("spin", TaskArgs::Positional(vec![]), limits).unwrap();
        let err = r.get(Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.context.contains("soft"));
    }

    #[test]
    fn test_get_timeout_and_duplicate_id() {
        let d = dispatcher(1);
        let r = d.send_task_with_id("s1", "spin", TaskArgs::Positional(vec![]), TaskLimits::default()).unwrap();
        assert_eq!(r.get(Some(Duration::from_millis(20))).unwrap_err().kind, ErrorKind::Timeout);
        assert!(d.send_task_with_id("s1", "echo", TaskArgs::Positional(vec![]), TaskLimits::default()).is_err());
        assert!(d.async_result("s1").is_some());
        assert!(d.async_result("nope").is_none());
        d.control().revoke("s1", true);
        assert_eq!(d.stats().failed, 1);
    }

    #[test]
    fn test_reserved_task_is_pending_until_submitted() {
        let d = dispatcher(1);
        let args = TaskArgs::keyword(&[("value", json!(7))]);
        d.reserve("r1", "echo", args.clone(), TaskLimits::default()).unwrap();
        assert_eq!(d.async_result("r1").unwrap().status(), TaskState::Pending);
        assert_eq!(d.stats().submitted, 0);

        let r = d.submit_reserved("r1").unwrap();
        assert_eq!(r.get(Some(Duration::from_secs(5))).unwrap(), json!(7));
        assert!(!d.discard_reserved("r1"));

        d.reserve("r2", "echo", args, TaskLimits::default()).unwrap();
        assert!(d.discard_reserved("r2"));
        assert!(d.async_result("r2").is_none());
        assert_eq!(d.submit_reserved("r2").unwrap_err().kind, ErrorKind::NotFound);
    }
}
