use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use conccache::cache::{CacheKey, ConcCacheMap, Registration};
use conccache::flight::{ProcessLiveness, StalePolicy};
use conccache::query::chain::QueryChain;
use conccache::query::operation::{QueryArgs, QueryOperation, ShuffleArgs};
use conccache::storage::pidfile::PidInfo;

fn key() -> CacheKey {
    CacheKey::from_chain(&QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#))).unwrap()
}

#[test]
fn test_one_producer_across_map_instances() {
    let dir = TempDir::new().unwrap();
    // separate instances share nothing but the directory, like separate workers
    let maps: Vec<Arc<ConcCacheMap>> = (0..2)
        .map(|_| Arc::new(ConcCacheMap::open(dir.path(), Duration::from_secs(10)).unwrap()))
        .collect();
    let barrier = Arc::new(Barrier::new(16));

    let claims: Vec<_> = (0..16)
        .map(|n| {
            let map = maps[n % 2].clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let policy = StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness));
                barrier.wait();
                map.register(&key(), &PidInfo::current(&format!("t{}", n)), &policy).unwrap()
            })
        })
        .collect();
    let results: Vec<Registration> = claims.into_iter().map(|c| c.join().unwrap()).collect();

    let producers: Vec<&Registration> = results
        .iter()
        .filter(|r| matches!(r, Registration::Producer { .. }))
        .collect();
    assert_eq!(producers.len(), 1);

    let owner = maps[0].get_entry(&key()).unwrap().unwrap().task_id.unwrap();
    for result in &results {
        if let Registration::Reader { owner: seen, .. } = result {
            assert_eq!(seen.task_id, owner);
        }
    }
}

#[test]
fn test_progress_visible_through_other_instance() {
    let dir = TempDir::new().unwrap();
    let writer = ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap();
    let reader = ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap();
    let policy = StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness));

    writer.register(&key(), &PidInfo::current("t1"), &policy).unwrap();
    writer.publish(&key(), 120, "t1", false).unwrap();
    assert_eq!(reader.get_stored_size(&key()).unwrap(), Some(120));
    assert!(!reader.get_entry(&key()).unwrap().unwrap().complete);

    writer.publish(&key(), 300, "t1", true).unwrap();
    writer.release(&key(), "t1").unwrap();
    match reader.register(&key(), &PidInfo::current("t2"), &policy).unwrap() {
        Registration::Ready { entry, .. } => assert_eq!(entry.size_seen, 300),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_invalidation_removes_derived_results() {
    let dir = TempDir::new().unwrap();
    let map = ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap();
    let chain = QueryChain::new("susanne", QueryArgs::cql(r#"[word="dog"]"#));
    let shuffled = CacheKey::from_chain(&chain.clone().then(QueryOperation::Shuffle(ShuffleArgs {}))).unwrap();

    let (base_path, _) = map.add_to_map(&key(), 4, None).unwrap();
    let (shuffled_path, _) = map.add_to_map(&shuffled, 4, None).unwrap();
    assert_eq!(map.entries("susanne").unwrap().len(), 2);

    assert_eq!(map.del_full_entry(&key()).unwrap(), 2);
    assert!(map.entries("susanne").unwrap().is_empty());
    assert!(!base_path.exists());
    assert!(!shuffled_path.exists());
}
