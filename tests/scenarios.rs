use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use conccache::core::config::Config;
use conccache::core::error::{ErrorKind, Result};
use conccache::core::types::UserId;
use conccache::engine::memory::MemoryCorpusEngine;
use conccache::engine::{ConcLine, Concordance, CorpusEngine, CorpusHandle};
use conccache::flight::{FlightState, ProcessLiveness, StalePolicy};
use conccache::cache::{CacheKey, Registration};
use conccache::storage::conc_file::{read_all, ConcFileWriter};
use conccache::storage::pidfile::PidInfo;
use conccache::tasks::{TaskDispatcher, TaskState};
use conccache::query::chain::QueryChain;
use conccache::query::operation::{FilterArgs, QueryArgs, QueryOperation, ShuffleArgs};
use conccache::service::{ComputationState, ComputationStatus, ConcordanceService, CoreBuilder};

fn corpus_text(sentences: usize) -> String {
    (0..sentences)
        .map(|i| match i % 4 {
            0 => "the dog barked at the cat",
            1 => "a black dog slept in the sun",
            2 => "nobody saw the big dog today",
            _ => "no animals were here",
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Engine whose first query stalls before returning, like a slow corpus backend
struct StallingEngine {
    inner: MemoryCorpusEngine,
    stall: Duration,
    stalled: AtomicBool,
}

impl CorpusEngine for StallingEngine {
    fn open_corpus(&self, name: &str) -> Result<CorpusHandle> {
        self.inner.open_corpus(name)
    }

    fn open_subcorpus(&self, corpus: &CorpusHandle, name: &str) -> Result<CorpusHandle> {
        self.inner.open_subcorpus(corpus, name)
    }

    fn is_available(&self, name: &str) -> bool {
        self.inner.is_available(name)
    }

    fn run_query(&self, corpus: &CorpusHandle, aligned: &[CorpusHandle], args: &QueryArgs) -> Result<Box<dyn Concordance>> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            thread::sleep(self.stall);
        }
        self.inner.run_query(corpus, aligned, args)
    }

    fn restore(&self, corpus: &CorpusHandle, aligned: &[CorpusHandle], lines: Vec<ConcLine>) -> Result<Box<dyn Concordance>> {
        self.inner.restore(corpus, aligned, lines)
    }
}

fn service_with(dir: &TempDir, engine: MemoryCorpusEngine) -> ConcordanceService {
    service_on(dir, Arc::new(engine))
}

fn service_on(dir: &TempDir, engine: Arc<dyn CorpusEngine>) -> ConcordanceService {
    let mut config = Config::with_root(dir.path());
    config.workers = 4;
    config.read_wait_timeout_ms = 10_000;
    config.progress_interval_ms = 10;
    config.reader_backoff_min_ms = 2;
    config.reader_backoff_max_ms = 50;
    CoreBuilder::new(config).with_engine(engine).build().unwrap()
}

fn service(dir: &TempDir) -> ConcordanceService {
    let engine = MemoryCorpusEngine::new().with_chunk_size(16);
    engine.register_text("susanne", &corpus_text(40));
    service_with(dir, engine)
}

fn dog() -> QueryChain {
    QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#))
}

fn wait_finished(service: &ConcordanceService, chain_id: &str) -> ComputationStatus {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let status = service.poll_computation(chain_id).unwrap();
        if matches!(status.state, ComputationState::Success | ComputationState::Failure) {
            return status;
        }
        assert!(Instant::now() < deadline, "computation of {} never finished", chain_id);
        thread::sleep(Duration::from_millis(10));
    }
}

/// The file holds exactly the published lines
fn assert_file_holds(service: &ConcordanceService, key: &CacheKey, size: u64) {
    let path = service.map.cache_file_path(key).unwrap().unwrap();
    assert_eq!(read_all(&path, size).unwrap().len() as u64, size);
    assert!(read_all(&path, size + 1).is_err());
}

/// Block until no task handler is executing, revoked ones included
fn wait_workers_idle(service: &ConcordanceService) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while service.dispatcher.stats().running > 0 {
        assert!(Instant::now() < deadline, "workers never went idle");
        thread::sleep(Duration::from_millis(10));
    }
}

fn positions(service: &ConcordanceService, chain_id: &str) -> Vec<u64> {
    service
        .read_lines(chain_id, 0, 1_000)
        .unwrap()
        .iter()
        .map(|l| l.position)
        .collect()
}

#[test]
fn test_submit_compute_and_read() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    let id = service.submit_chain(UserId(1), &dog()).unwrap();
    assert_eq!(id.len(), 12);
    assert_eq!(service.get_chain(&id).unwrap().data, dog());

    service.start_computation(&id).unwrap();
    let status = wait_finished(&service, &id);
    assert_eq!(status.state, ComputationState::Success);
    assert_eq!(status.total_size, Some(30));

    let lines = service.read_lines(&id, 0, 10).unwrap();
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|l| l.kwic == vec!["dog"]));
}

#[test]
fn test_identical_chains_share_one_task() {
    let dir = TempDir::new().unwrap();
    let engine = MemoryCorpusEngine::new()
        .with_chunk_size(4)
        .with_step_delay(Duration::from_millis(2));
    engine.register_text("susanne", &corpus_text(40));
    let service = Arc::new(service_with(&dir, engine));

    let barrier = Arc::new(Barrier::new(2));
    let clients: Vec<_> = [UserId(1), UserId(2)]
        .into_iter()
        .map(|user| {
            let service = service.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let id = service.submit_chain(user, &dog()).unwrap();
                let task_id = service.start_computation(&id).unwrap();
                let lines = service.read_lines(&id, 0, 5).unwrap();
                (id, task_id, lines)
            })
        })
        .collect();
    let results: Vec<_> = clients.into_iter().map(|c| c.join().unwrap()).collect();

    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].1, results[1].1);
    assert_eq!(results[0].2, results[1].2);

    wait_finished(&service, &results[0].0);
    let conc_files = fs::read_dir(dir.path().join("cache").join("susanne"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "conc"))
        .count();
    assert_eq!(conc_files, 1);
    assert_eq!(service.stats().unwrap().tasks.submitted, 1);
}

#[test]
fn test_negative_filter_never_grows() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);

    let base_id = service.submit_chain(UserId(1), &dog()).unwrap();
    let filtered = dog().then(QueryOperation::Filter(FilterArgs::cql(r#"[word="black"]"#, [-5, 5], true)));
    let filtered_id = service.submit_chain_after(UserId(1), &filtered, &base_id).unwrap();
    assert_ne!(base_id, filtered_id);

    service.start_computation(&base_id).unwrap();
    service.start_computation(&filtered_id).unwrap();
    let all = wait_finished(&service, &base_id).total_size.unwrap();
    let kept = wait_finished(&service, &filtered_id).total_size.unwrap();

    assert!(kept <= all);
    assert_eq!(kept, 20);
}

#[test]
fn test_shuffle_order_is_reproducible() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let chain = dog().then(QueryOperation::Shuffle(ShuffleArgs {}));

    let id = service.submit_chain(UserId(1), &chain).unwrap();
    service.start_computation(&id).unwrap();
    assert_eq!(wait_finished(&service, &id).state, ComputationState::Success);
    let first = positions(&service, &id);

    // drop every cached result so the second run recomputes from scratch
    service.invalidate(UserId(1), &id).unwrap();
    assert_eq!(service.poll_computation(&id).unwrap().state, ComputationState::NotStarted);

    let again = service.submit_chain(UserId(1), &chain).unwrap();
    assert_eq!(again, id);
    service.start_computation(&again).unwrap();
    assert_eq!(wait_finished(&service, &again).state, ComputationState::Success);
    let second = positions(&service, &again);

    assert_eq!(first.len(), 30);
    assert_eq!(first, second);
    let mut sorted = first.clone();
    sorted.sort_unstable();
    assert_ne!(first, sorted);
}

#[test]
fn test_revoked_computation_restarts_cleanly() {
    let dir = TempDir::new().unwrap();
    let engine = MemoryCorpusEngine::new()
        .with_chunk_size(4)
        .with_step_delay(Duration::from_millis(5));
    engine.register_text("susanne", &corpus_text(400));
    let service = service_with(&dir, engine);

    let id = service.submit_chain(UserId(1), &dog()).unwrap();
    let first_task = service.start_computation(&id).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(service.cancel_computation(&id).unwrap());

    let status = service.poll_computation(&id).unwrap();
    assert_eq!(status.state, ComputationState::Failure);
    assert_eq!(status.error.unwrap().kind, "Cancelled");

    let again = service.submit_chain(UserId(1), &dog()).unwrap();
    let second_task = service.start_computation(&again).unwrap();
    assert_ne!(first_task, second_task);

    let key = CacheKey::from_chain(&dog()).unwrap();
    match service.flight.state(&key).unwrap() {
        FlightState::Claimed(owner) => assert_eq!(owner.task_id, second_task),
        other => panic!("expected a fresh claim, got {:?}", other),
    }

    let first = service.dispatcher.async_result(&first_task).unwrap();
    assert_eq!(first.get(Some(Duration::from_secs(1))).unwrap_err().kind, ErrorKind::Cancelled);

    let status = wait_finished(&service, &again);
    assert_eq!(status.state, ComputationState::Success);
    assert_eq!(status.total_size, Some(300));
    wait_workers_idle(&service);
    assert_eq!(service.read_lines(&again, 0, 1_000).unwrap().len(), 300);
    assert_file_holds(&service, &key, 300);
}

#[test]
fn test_cancel_during_slow_query_keeps_successor_file() {
    let dir = TempDir::new().unwrap();
    let inner = MemoryCorpusEngine::new().with_chunk_size(16);
    inner.register_text("susanne", &corpus_text(40));
    let engine = StallingEngine { inner, stall: Duration::from_millis(500), stalled: AtomicBool::new(false) };
    let service = service_on(&dir, Arc::new(engine));

    let id = service.submit_chain(UserId(1), &dog()).unwrap();
    let first_task = service.start_computation(&id).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(service.cancel_computation(&id).unwrap());

    service.start_computation(&id).unwrap();
    let status = wait_finished(&service, &id);
    assert_eq!(status.state, ComputationState::Success);
    assert_eq!(status.total_size, Some(30));

    // let the stalled worker come back from its query
    wait_workers_idle(&service);
    let first = service.dispatcher.async_result(&first_task).unwrap();
    assert_eq!(first.status(), TaskState::Failure);

    assert_eq!(service.read_lines(&id, 0, 100).unwrap().len(), 30);
    assert_file_holds(&service, &CacheKey::from_chain(&dog()).unwrap(), 30);
}

#[test]
fn test_stale_claim_takeover_keeps_new_file() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let key = CacheKey::from_chain(&dog()).unwrap();

    // a producer thread whose task the dispatcher never heard of
    let policy = StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness));
    let ghost = service.map.register(&key, &PidInfo::current("ghost"), &policy).unwrap();
    assert!(matches!(ghost, Registration::Producer { .. }));
    let (ghost_path, ghost_file) = service.map.open_owned(&key, "ghost").unwrap();
    let mut ghost_writer = ConcFileWriter::from_file(&ghost_path, ghost_file);

    let id = service.submit_chain(UserId(1), &dog()).unwrap();
    service.start_computation(&id).unwrap();
    assert_eq!(wait_finished(&service, &id).total_size, Some(30));

    let stray = service.read_lines(&id, 0, 3).unwrap();
    ghost_writer.write_all(&stray).unwrap();
    ghost_writer.finish().unwrap();
    assert_eq!(service.map.open_owned(&key, "ghost").unwrap_err().kind, ErrorKind::Cancelled);

    assert_eq!(service.read_lines(&id, 0, 100).unwrap().len(), 30);
    assert_file_holds(&service, &key, 30);
}

#[test]
fn test_archive_requires_ownership() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let id = service.submit_chain(UserId(1), &dog()).unwrap();

    let err = service.archive(UserId(2), &id, false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Forbidden);
    assert!(!service.get_chain(&id).unwrap().archived);

    let (_, record) = service.archive(UserId(1), &id, false).unwrap();
    assert!(record.archived);
    let reopened = service.get_chain(&id).unwrap();
    assert!(reopened.archived);
    assert_eq!(reopened.data, dog());
}

#[test]
fn test_empty_result_is_success() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let chain = QueryChain::new("susanne", QueryArgs::cql(r#"[word="unicorn"]"#));

    let id = service.submit_chain(UserId(1), &chain).unwrap();
    service.start_computation(&id).unwrap();
    let status = wait_finished(&service, &id);
    assert_eq!(status.state, ComputationState::Success);
    assert_eq!(status.total_size, Some(0));
    assert!(service.read_lines(&id, 0, 10).unwrap().is_empty());
}

#[test]
fn test_unavailable_aligned_corpus_fails() {
    let dir = TempDir::new().unwrap();
    let engine = MemoryCorpusEngine::new();
    engine.register_text("susanne", &corpus_text(8));
    engine.register_text("susanne_cs", &corpus_text(8));
    engine.set_available("susanne_cs", false);
    let service = service_with(&dir, engine);

    let chain = dog().with_aligned("susanne_cs");
    let id = service.submit_chain(UserId(1), &chain).unwrap();
    service.start_computation(&id).unwrap();

    let status = wait_finished(&service, &id);
    assert_eq!(status.state, ComputationState::Failure);
    assert_eq!(status.error.unwrap().kind, "AlignedCorpusUnavailable");

    let err = service.read_lines(&id, 0, 10).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlignedCorpusUnavailable);
}

#[test]
fn test_invalidate_by_stranger_is_forbidden() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir);
    let id = service.submit_chain(UserId(1), &dog()).unwrap();
    service.start_computation(&id).unwrap();
    wait_finished(&service, &id);

    assert_eq!(service.invalidate(UserId(2), &id).unwrap_err().kind, ErrorKind::Forbidden);
    assert_eq!(service.poll_computation(&id).unwrap().state, ComputationState::Success);
}
