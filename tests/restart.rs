use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use conccache::core::config::Config;
use conccache::core::types::UserId;
use conccache::engine::memory::MemoryCorpusEngine;
use conccache::query::chain::QueryChain;
use conccache::query::operation::QueryArgs;
use conccache::service::{ComputationState, ConcordanceService, CoreBuilder};

const TEXT: &str = "the dog barked\na black dog slept\nthe cat saw the dog";

fn open(dir: &TempDir) -> ConcordanceService {
    let engine = MemoryCorpusEngine::new();
    engine.register_text("susanne", TEXT);
    let mut config = Config::with_root(dir.path());
    config.kvs_journal_dir = Some(dir.path().join("kvs"));
    config.workers = 2;
    CoreBuilder::new(config).with_engine(Arc::new(engine)).build().unwrap()
}

fn wait_success(service: &ConcordanceService, id: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.poll_computation(id).unwrap().state != ComputationState::Success {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_chains_and_results_survive_restart() {
    let dir = TempDir::new().unwrap();
    let chain = QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#));

    let (id, task_id, lines) = {
        let service = open(&dir);
        let id = service.submit_chain(UserId(1), &chain).unwrap();
        let task_id = service.start_computation(&id).unwrap();
        wait_success(&service, &id);
        let lines = service.read_lines(&id, 0, 10).unwrap();
        service.shutdown();
        (id, task_id, lines)
    };
    assert_eq!(lines.len(), 3);

    let service = open(&dir);
    assert_eq!(service.get_chain(&id).unwrap().data, chain);
    assert_eq!(service.poll_computation(&id).unwrap().state, ComputationState::Success);

    // the cached result answers without a new task
    assert_eq!(service.start_computation(&id).unwrap(), task_id);
    assert_eq!(service.read_lines(&id, 0, 10).unwrap(), lines);
    assert_eq!(service.stats().unwrap().tasks.submitted, 0);
}

#[test]
fn test_journal_without_checkpoint_is_replayed() {
    let dir = TempDir::new().unwrap();
    let chain = QueryChain::new("susanne", QueryArgs::cql(r#"[word="cat"]"#));

    let id = {
        let service = open(&dir);
        let id = service.submit_chain(UserId(3), &chain).unwrap();
        if let Some(journal) = &service.journal {
            journal.sync().unwrap();
        }
        // skip the shutdown checkpoint; only the journal holds the record
        std::mem::forget(service);
        id
    };

    let service = open(&dir);
    let record = service.get_chain(&id).unwrap();
    assert_eq!(record.user_id, UserId(3));
    assert_eq!(record.data, chain);
}
