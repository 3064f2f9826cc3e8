/// Conccache API Demo
///
/// Walks through the main service operations:
/// - Submitting and reopening query chains
/// - Starting computations and polling progress
/// - Reading concordance pages
/// - Derived chains (filter, sort, shuffle) reusing cached results
/// - Statistics, health checks and archival

use conccache::core::config::Config;
use conccache::core::logging::init_logging;
use conccache::core::types::UserId;
use conccache::engine::memory::MemoryCorpusEngine;
use conccache::query::chain::QueryChain;
use conccache::query::operation::{
    FilterArgs, QueryArgs, QueryOperation, ShuffleArgs, SortArgs, SortContext, SortLevel,
};
use conccache::service::{ComputationState, ConcordanceService, CoreBuilder};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TEXT: &str = "the dog barked at the postman\n\
                    a black dog slept under the table\n\
                    the cat watched the old dog\n\
                    nobody heard the dogs that night\n\
                    every dog has its day";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    println!("\n╔═══════════════════════════════════════════════╗");
    println!("║   Conccache - Concordance Service Demo        ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // Step 1: Build the service
    println!("Building service...");
    let root = tempfile::TempDir::new()?;
    let engine = MemoryCorpusEngine::new();
    engine.register_text("demo_en", TEXT);
    let service = CoreBuilder::new(Config::with_root(root.path()))
        .with_engine(Arc::new(engine))
        .build()?;
    println!("Done!\n");

    // Step 2: Submit a chain
    println!("Step 2: SUBMIT - Storing a query chain...");
    let user = UserId(1);
    let query = QueryChain::new("demo_en", QueryArgs::cql(r#"[word="dog"]"#));
    let id = service.submit_chain(user, &query)?;
    println!("  Chain id: {}", id);
    println!("  Same chain again: {}\n", service.submit_chain(user, &query)?);

    // Step 3: Compute and read
    println!("Step 3: COMPUTE - Running the query...");
    let task_id = service.start_computation(&id)?;
    println!("  Task: {}", task_id);
    wait(&service, &id)?;
    for line in service.read_lines(&id, 0, 10)? {
        println!("  {:>4}  {:>30} [{}] {}", line.position, line.left.join(" "), line.kwic.join(" "), line.right.join(" "));
    }
    println!();

    // Step 4: Derived chains
    println!("Step 4: DERIVE - Filter, sort and shuffle...");
    let filtered = query
        .clone()
        .then(QueryOperation::Filter(FilterArgs::cql(r#"[word="black|old"]"#, [-3, 0], true)));
    let sorted = filtered.clone().then(QueryOperation::Sort(SortArgs {
        levels: vec![SortLevel {
            attr: "word".to_string(),
            ctx: SortContext::Right,
            ignore_case: true,
            backward: false,
        }],
    }));
    let shuffled = query.clone().then(QueryOperation::Shuffle(ShuffleArgs {}));

    for (name, chain) in [("filtered", &filtered), ("sorted", &sorted), ("shuffled", &shuffled)] {
        let derived = service.submit_chain_after(user, chain, &id)?;
        service.start_computation(&derived)?;
        let size = wait(&service, &derived)?;
        let order: Vec<u64> = service.read_lines(&derived, 0, 10)?.iter().map(|l| l.position).collect();
        println!("  {:<9} {} lines, positions {:?}", name, size, order);
    }
    println!();

    // Step 5: Statistics and health
    println!("Step 5: STATS - Monitoring...");
    let stats = service.stats()?;
    println!("  Cache entries: {} ({} bytes)", stats.cache.entries, stats.cache.total_bytes);
    println!("  Tasks submitted: {}", stats.tasks.submitted);
    println!("  Hot records: {}", stats.hot_records);
    println!("  Health: {:?}\n", service.health_check().status);

    // Step 6: Archive
    println!("Step 6: ARCHIVE - Moving the chain to cold storage...");
    let (changed, record) = service.archive(user, &id, false)?;
    println!("  Changed: {}, archived: {}", changed, record.archived);
    println!("  Still readable: {}\n", service.get_chain(&id).is_ok());

    service.shutdown();
    println!("Demo finished.");
    Ok(())
}

fn wait(service: &ConcordanceService, id: &str) -> Result<u64, Box<dyn std::error::Error>> {
    loop {
        let status = service.poll_computation(id)?;
        match status.state {
            ComputationState::Success => return Ok(status.total_size.unwrap_or(status.current_size)),
            ComputationState::Failure => {
                return Err(format!("computation failed: {:?}", status.error).into());
            }
            _ => thread::sleep(Duration::from_millis(20)),
        }
    }
}
