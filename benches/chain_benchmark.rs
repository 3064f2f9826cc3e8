use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use conccache::cache::{CacheKey, ConcCacheMap};
use conccache::compute::ConcCalculator;
use conccache::engine::memory::MemoryCorpusEngine;
use conccache::engine::ConcLine;
use conccache::flight::{ProcessLiveness, SingleFlight, StalePolicy};
use conccache::query::chain::QueryChain;
use conccache::query::ident::derive_chain_id;
use conccache::query::operation::{FilterArgs, QueryArgs, QueryOperation, SampleArgs, ShuffleArgs};
use conccache::storage::conc_file::{read_range, ConcFileWriter};
use conccache::storage::pidfile::PidInfo;
use conccache::tasks::TaskContext;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to build a random corpus of `sentences` lines
fn corpus_text(sentences: usize) -> String {
    let mut rng = rand::thread_rng();
    let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];
    (0..sentences)
        .map(|_| {
            (0..12)
                .map(|_| words[rng.gen_range(0..words.len())])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn chain_of(len: usize) -> QueryChain {
    let mut chain = QueryChain::new("bench", QueryArgs::cql(r#"[word="dog"]"#));
    for i in 1..len {
        let op = match i % 3 {
            0 => QueryOperation::Shuffle(ShuffleArgs {}),
            1 => QueryOperation::Filter(FilterArgs::cql(r#"[word="lazy"]"#, [-2, 2], i % 2 == 0)),
            _ => QueryOperation::Sample(SampleArgs { rlines: 100 }),
        };
        chain = chain.then(op);
    }
    chain
}

/// Benchmark chain id derivation and cache key construction
fn bench_chain_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_identity");

    for len in [1, 4, 8].iter() {
        let chain = chain_of(*len);
        group.bench_with_input(BenchmarkId::new("chain_id", len), &chain, |b, chain| {
            b.iter(|| derive_chain_id(black_box(chain)));
        });
        group.bench_with_input(BenchmarkId::new("cache_key", len), &chain, |b, chain| {
            b.iter(|| CacheKey::from_chain(black_box(chain)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark the claim / publish / release cycle on the cache map
fn bench_claim_cycle(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let map = ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap();
    let policy = StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness));
    let key = CacheKey::from_chain(&chain_of(1)).unwrap();

    c.bench_function("claim_publish_release", |b| {
        let mut n = 0u64;
        b.iter(|| {
            let task_id = format!("bench-{}", n);
            map.register(&key, &PidInfo::current(&task_id), &policy).unwrap();
            map.publish(&key, 100, &task_id, true).unwrap();
            map.release(&key, &task_id).unwrap();
            map.del_full_entry(&key).unwrap();
            n += 1;
        });
    });
}

/// Benchmark full computations of chains of growing length
fn bench_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let engine = Arc::new(MemoryCorpusEngine::new());
    engine.register_text("bench", &corpus_text(2_000));
    let map = Arc::new(ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap());
    let flight = Arc::new(SingleFlight::new(
        map.clone(),
        StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness)),
        (Duration::from_millis(1), Duration::from_millis(50)),
    ));
    let calc = ConcCalculator::new(engine, flight, Duration::from_millis(200));

    for len in [1, 3, 6].iter() {
        let chain = chain_of(*len);
        let key = CacheKey::from_chain(&chain).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(len), &chain, |b, chain| {
            let mut n = 0u64;
            b.iter(|| {
                map.del_full_entry(&key).unwrap();
                let ctx = TaskContext::detached(&format!("bench-{}", n));
                n += 1;
                calc.compute(&ctx, chain).unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark paging through a stored concordance
fn bench_read_range(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.conc");
    let mut writer = ConcFileWriter::create(&path).unwrap();
    for position in 0..10_000u64 {
        writer
            .write_line(&ConcLine {
                position,
                kwic_len: 1,
                left: vec!["the".into(), "lazy".into()],
                kwic: vec!["dog".into()],
                right: vec!["jumps".into(), "over".into()],
                aligned: Vec::new(),
                group: None,
            })
            .unwrap();
    }
    let size = writer.finish().unwrap();

    let mut group = c.benchmark_group("read_range");
    for offset in [0u64, 5_000, 9_900].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(offset), offset, |b, &offset| {
            b.iter(|| read_range(&path, offset, 100, size).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain_identity, bench_claim_cycle, bench_compute, bench_read_range);
criterion_main!(benches);
