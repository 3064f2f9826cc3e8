use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use crate::cache::key::CacheKey;
use crate::core::error::{Error, ErrorKind, Result};
use crate::engine::{Concordance, CorpusEngine, CorpusHandle};
use crate::flight::coordinator::{Claim, FlightState, SingleFlight};
use crate::query::chain::QueryChain;
use crate::query::ident::{derive_chain_id, seed_from_id};
use crate::query::operation::{QueryArgs, QueryOperation};
use crate::storage::conc_file::{read_all, ConcFileWriter};
use crate::tasks::context::TaskContext;

/// Lines materialized per write when dumping a finished concordance
const WRITE_CHUNK: u64 = 10_000;
/// How long a single reader wait lasts before re-checking cancellation
const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeOutcome {
    pub size: u64,
    /// Operations taken from an already cached prefix
    pub reused_ops: usize,
    /// False when somebody else produced the result
    pub produced: bool,
}

/// Primary corpus (with subcorpus) and the aligned corpora in declared order
struct Resolved {
    primary: CorpusHandle,
    aligned: Vec<CorpusHandle>,
}

impl Resolved {
    /// Corpora arrangement after the first `n` operations of `chain`
    fn after(&self, chain: &QueryChain, n: usize) -> (CorpusHandle, Vec<CorpusHandle>) {
        let mut main = self.primary.clone();
        let mut aligned = self.aligned.clone();
        for op in chain.operations.iter().take(n) {
            if let QueryOperation::SwitchMainCorp(args) = op {
                if let Some(idx) = aligned.iter().position(|c| c.name == args.maincorp) {
                    let new_main = aligned.remove(idx);
                    aligned.insert(0, std::mem::replace(&mut main, new_main));
                }
            }
        }
        (main, aligned)
    }
}

/// Runs a query chain through the corpus engine and streams the result
/// into the concordance cache.
pub struct ConcCalculator {
    pub engine: Arc<dyn CorpusEngine>,
    pub flight: Arc<SingleFlight>,
    pub progress_interval: Duration,
}

impl ConcCalculator {
    pub fn new(engine: Arc<dyn CorpusEngine>, flight: Arc<SingleFlight>, progress_interval: Duration) -> Self {
        ConcCalculator {
            engine,
            flight,
            progress_interval,
        }
    }

    /// Compute `chain` under the task in `ctx`. The chain's cache key may
    /// already be claimed by this task; otherwise it is claimed here.
    pub fn compute(&self, ctx: &TaskContext, chain: &QueryChain) -> Result<ComputeOutcome> {
        chain.validate()?;
        let key = CacheKey::from_chain(chain)?;

        match self.flight.claim(&key, &ctx.task_id)? {
            Claim::Ready { size, .. } => {
                return Ok(ComputeOutcome { size, reused_ops: chain.len(), produced: false });
            }
            Claim::Reader { owner, .. } if owner.task_id != ctx.task_id => {
                let size = self.wait_for(ctx, &key)?;
                return Ok(ComputeOutcome { size, reused_ops: chain.len(), produced: false });
            }
            Claim::Reader { .. } | Claim::Producer { .. } => {}
        }

        let started = Instant::now();
        info!(task_id = %ctx.task_id, key = %key, ops = chain.len(), "computing concordance");
        match self.produce(ctx, chain, &key) {
            Ok(outcome) => {
                info!(
                    task_id = %ctx.task_id,
                    key = %key,
                    size = outcome.size,
                    reused_ops = outcome.reused_ops,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "concordance ready"
                );
                Ok(outcome)
            }
            Err(e) => {
                let err = classify(e);
                error!(task_id = %ctx.task_id, key = %key, kind = err.kind.as_str(), error = %err, "concordance computation failed");
                if let Err(cleanup) = self.flight.abandon(&key, &ctx.task_id) {
                    warn!(key = %key, error = %cleanup, "failed to abandon cache entry");
                }
                Err(err)
            }
        }
    }

    fn produce(&self, ctx: &TaskContext, chain: &QueryChain, key: &CacheKey) -> Result<ComputeOutcome> {
        let resolved = self.resolve(chain)?;
        let query = chain
            .query()
            .ok_or_else(|| Error::new(ErrorKind::BadInput, "chain must start with a query".to_string()))?;
        let total = chain.len();

        if total == 1 {
            let conc = self.stream_query(ctx, &resolved, query, key)?;
            let size = conc.size();
            self.flight.complete(key, &ctx.task_id, size)?;
            return Ok(ComputeOutcome { size, reused_ops: 0, produced: true });
        }

        let (mut conc, reused_ops) = match self.cached_prefix(chain, key, &resolved)? {
            Some(found) => found,
            None => (self.base_concordance(ctx, chain, key, &resolved, query)?, 0),
        };
        let start = reused_ops.max(1);

        for i in start..total {
            ctx.checkpoint()?;
            self.apply(conc.as_mut(), chain, i)?;
            ctx.checkpoint()?;
            if i + 1 < total {
                self.store_intermediate(ctx, &key.prefix(i + 1), conc.as_ref());
            }
        }

        let size = conc.size();
        write_lines(conc.as_ref(), self.flight.writer(key, &ctx.task_id)?)?;
        self.flight.complete(key, &ctx.task_id, size)?;
        Ok(ComputeOutcome { size, reused_ops, produced: true })
    }

    fn resolve(&self, chain: &QueryChain) -> Result<Resolved> {
        let mut primary = self.engine.open_corpus(&chain.corpname).map_err(|e| {
            Error::new(ErrorKind::BadInput, format!("cannot open corpus '{}': {}", chain.corpname, e.context))
        })?;
        if let Some(subcorpus) = &chain.subcorpus {
            primary = self.engine.open_subcorpus(&primary, &subcorpus.name).map_err(|e| {
                Error::new(ErrorKind::BadInput, format!("cannot open subcorpus '{}': {}", subcorpus.name, e.context))
            })?;
        }

        let mut aligned = Vec::with_capacity(chain.aligned.len());
        for name in &chain.aligned {
            let unavailable = || {
                Error::new(ErrorKind::AlignedCorpusUnavailable, format!("aligned corpus '{}' is not available", name))
            };
            if !self.engine.is_available(name) {
                return Err(unavailable());
            }
            aligned.push(self.engine.open_corpus(name).map_err(|_| unavailable())?);
        }
        Ok(Resolved { primary, aligned })
    }

    /// Longest finished proper prefix, restored through the engine
    fn cached_prefix(
        &self,
        chain: &QueryChain,
        key: &CacheKey,
        resolved: &Resolved,
    ) -> Result<Option<(Box<dyn Concordance>, usize)>> {
        for len in (1..chain.len()).rev() {
            let prefix = key.prefix(len);
            if let FlightState::Ready { size } = self.flight.state(&prefix)? {
                match self.restore_prefix(chain, &prefix, len, size, resolved) {
                    Ok(conc) => {
                        debug!(key = %key, reused = len, "restored cached prefix");
                        return Ok(Some((conc, len)));
                    }
                    Err(e) if e.kind == ErrorKind::AlignedCorpusUnavailable => return Err(e),
                    Err(e) => warn!(prefix = %prefix, error = %e, "cached prefix unusable"),
                }
            }
        }
        Ok(None)
    }

    fn restore_prefix(
        &self,
        chain: &QueryChain,
        prefix: &CacheKey,
        len: usize,
        size: u64,
        resolved: &Resolved,
    ) -> Result<Box<dyn Concordance>> {
        let path = self
            .flight
            .map
            .cache_file_path(prefix)?
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("cache entry {} vanished", prefix)))?;
        let lines = read_all(&path, size)?;
        let (main, aligned) = resolved.after(chain, len);
        self.engine.restore(&main, &aligned, lines)
    }

    /// The query step of a longer chain, shared through the one-operation prefix entry
    fn base_concordance(
        &self,
        ctx: &TaskContext,
        chain: &QueryChain,
        key: &CacheKey,
        resolved: &Resolved,
        query: &QueryArgs,
    ) -> Result<Box<dyn Concordance>> {
        let base = key.base();
        match self.flight.claim(&base, &ctx.task_id)? {
            Claim::Producer { .. } => {
                let streamed = self
                    .stream_query(ctx, resolved, query, &base)
                    .and_then(|conc| {
                        self.flight.complete(&base, &ctx.task_id, conc.size())?;
                        Ok(conc)
                    });
                if streamed.is_err() {
                    if let Err(cleanup) = self.flight.abandon(&base, &ctx.task_id) {
                        warn!(key = %base, error = %cleanup, "failed to abandon base entry");
                    }
                }
                streamed
            }
            Claim::Reader { owner, .. } if owner.task_id == ctx.task_id => self.stream_query(ctx, resolved, query, &base),
            Claim::Reader { .. } => {
                let size = self.wait_for(ctx, &base)?;
                self.restore_prefix(chain, &base, 1, size, resolved)
            }
            Claim::Ready { size, .. } => self.restore_prefix(chain, &base, 1, size, resolved),
        }
    }

    /// Run the query, appending lines as they are found and publishing
    /// the size every `progress_interval`
    fn stream_query(
        &self,
        ctx: &TaskContext,
        resolved: &Resolved,
        query: &QueryArgs,
        target: &CacheKey,
    ) -> Result<Box<dyn Concordance>> {
        let mut conc = self.engine.run_query(&resolved.primary, &resolved.aligned, query)?;
        let mut writer = self.flight.writer(target, &ctx.task_id)?;
        let mut written = 0u64;
        let mut last_publish = Instant::now();

        loop {
            ctx.checkpoint()?;
            let done = conc.advance()?;
            let size = conc.size();
            if size > written {
                writer.write_all(&conc.lines(written, size)?)?;
                written = size;
            }
            if done {
                break;
            }
            if last_publish.elapsed() >= self.progress_interval {
                writer.flush()?;
                self.flight.publish(target, &ctx.task_id, written)?;
                last_publish = Instant::now();
            }
        }
        writer.finish()?;
        Ok(conc)
    }

    /// Operation `i` of the chain. Random steps are seeded by the id of the
    /// prefix ending at that step, so repeating the chain repeats the order.
    fn apply(&self, conc: &mut dyn Concordance, chain: &QueryChain, i: usize) -> Result<()> {
        let seed = || seed_from_id(&derive_chain_id(&chain.prefix(i + 1)));
        match &chain.operations[i] {
            QueryOperation::Query(_) => Err(Error::new(
                ErrorKind::BadInput,
                format!("unexpected query at step {}", i),
            )),
            QueryOperation::Filter(args) => conc.filter(args),
            QueryOperation::Sort(args) => conc.sort(args),
            QueryOperation::Sample(args) => conc.sample(args.rlines, seed()),
            QueryOperation::Shuffle(_) => conc.shuffle(seed()),
            QueryOperation::SwitchMainCorp(args) => conc.switch_main(&args.maincorp),
            QueryOperation::LinesGroup(args) => {
                let groups: Vec<(u64, u16)> = args.groups.iter().map(|g| (g.position, g.group)).collect();
                conc.set_groups(&groups)
            }
            QueryOperation::Locked(_) => Ok(()),
        }
    }

    /// Cache an intermediate prefix if nobody else owns it. Failures only cost the cache.
    fn store_intermediate(&self, ctx: &TaskContext, prefix: &CacheKey, conc: &dyn Concordance) {
        match self.flight.claim(prefix, &ctx.task_id) {
            Ok(Claim::Producer { .. }) => {}
            Ok(_) => return,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "cannot claim intermediate result");
                return;
            }
        }

        let stored = self
            .flight
            .writer(prefix, &ctx.task_id)
            .and_then(|writer| write_lines(conc, writer))
            .and_then(|_| self.flight.complete(prefix, &ctx.task_id, conc.size()));
        if let Err(e) = stored {
            warn!(prefix = %prefix, error = %e, "failed to store intermediate result");
            if let Err(cleanup) = self.flight.abandon(prefix, &ctx.task_id) {
                warn!(prefix = %prefix, error = %cleanup, "failed to abandon intermediate result");
            }
        }
    }

    /// Wait for another producer to finish, checking for cancellation in between
    fn wait_for(&self, ctx: &TaskContext, key: &CacheKey) -> Result<u64> {
        loop {
            ctx.checkpoint()?;
            match self.flight.attach(key, u64::MAX, Some(WAIT_SLICE)) {
                Ok(outcome) => return Ok(outcome.size()),
                Err(e) if e.kind == ErrorKind::Timeout => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn write_lines(conc: &dyn Concordance, mut writer: ConcFileWriter) -> Result<()> {
    let size = conc.size();
    let mut from = 0;
    while from < size {
        let to = (from + WRITE_CHUNK).min(size);
        writer.write_all(&conc.lines(from, to)?)?;
        from = to;
    }
    writer.finish()?;
    Ok(())
}

/// Engine and storage failures surface as a calculation failure;
/// cancellation, limits and input problems keep their kind.
fn classify(err: Error) -> Error {
    match err.kind {
        ErrorKind::Cancelled
        | ErrorKind::Timeout
        | ErrorKind::AlignedCorpusUnavailable
        | ErrorKind::BadInput
        | ErrorKind::ConcCalculationFailed => err,
        _ => Error::new(ErrorKind::ConcCalculationFailed, format!("{} ({})", err.context, err.kind.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use crate::cache::map::ConcCacheMap;
    use crate::engine::memory::MemoryCorpusEngine;
    use crate::flight::liveness::{ProcessLiveness, StalePolicy};
    use crate::query::operation::{FilterArgs, SampleArgs, ShuffleArgs, SortArgs, SortContext, SortLevel, SwitchMainArgs};
    use crate::storage::conc_file::read_all;

    const EN: &str = "the dog barked\n\
                      a black dog slept\n\
                      the cat saw the dog\n\
                      no animals here\n\
                      dogs and a dog";
    const CS: &str = "pes štěkal\nčerný pes spal\nkočka viděla psa\nžádná zvířata\npsi a pes";

    struct Fixture {
        _dir: TempDir,
        engine: Arc<MemoryCorpusEngine>,
        calc: ConcCalculator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryCorpusEngine::new().with_chunk_size(4));
        engine.register_text("en", EN);
        engine.register_text("cs", CS);
        let map = Arc::new(ConcCacheMap::open(dir.path(), Duration::from_secs(5)).unwrap());
        let flight = Arc::new(SingleFlight::new(
            map,
            StalePolicy::new(Duration::from_secs(3600), Arc::new(ProcessLiveness)),
            (Duration::from_millis(1), Duration::from_millis(10)),
        ));
        let calc = ConcCalculator::new(engine.clone(), flight, Duration::ZERO);
        Fixture { _dir: dir, engine, calc }
    }

    fn lines_of(f: &Fixture, chain: &QueryChain) -> Vec<u64> {
        let key = CacheKey::from_chain(chain).unwrap();
        let entry = f.calc.flight.map.get_entry(&key).unwrap().unwrap();
        let path = f.calc.flight.map.entry_path(&key.corpname, &entry);
        read_all(&path, entry.size_seen).unwrap().iter().map(|l| l.position).collect()
    }

    #[test]
    fn test_single_query() {
        let f = fixture();
        let chain = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#));
        let outcome = f.calc.compute(&TaskContext::detached("t1"), &chain).unwrap();
        assert_eq!(outcome.size, 4);
        assert!(outcome.produced);
        assert_eq!(lines_of(&f, &chain), vec![1, 5, 11, 18]);

        let again = f.calc.compute(&TaskContext::detached("t2"), &chain).unwrap();
        assert!(!again.produced);
        assert_eq!(f.engine.queries_run.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_empty_result_is_cached() {
        let f = fixture();
        let chain = QueryChain::new("en", QueryArgs::cql(r#"[word="unicorn"]"#));
        assert_eq!(f.calc.compute(&TaskContext::detached("t1"), &chain).unwrap().size, 0);
        let key = CacheKey::from_chain(&chain).unwrap();
        assert!(f.calc.flight.map.get_entry(&key).unwrap().unwrap().complete);
    }

    #[test]
    fn test_shuffle_reuses_base_and_is_deterministic() {
        let f = fixture();
        let base = QueryChain::new("en", QueryArgs::cql(r#"[word="the|a|dog"]"#));
        let shuffled = base.clone().then(QueryOperation::Shuffle(ShuffleArgs {}));

        let first = f.calc.compute(&TaskContext::detached("t1"), &shuffled).unwrap();
        assert_eq!(first.reused_ops, 0);
        let order = lines_of(&f, &shuffled);

        // the base query got cached on the way
        let key = CacheKey::from_chain(&base).unwrap();
        assert!(f.calc.flight.map.get_entry(&key).unwrap().unwrap().complete);

        f.calc.flight.map.del_full_entry(&CacheKey::from_chain(&shuffled).unwrap()).unwrap();
        f.calc.compute(&TaskContext::detached("t1b"), &base).unwrap();
        let second = f.calc.compute(&TaskContext::detached("t2"), &shuffled).unwrap();
        assert_eq!(second.reused_ops, 1);
        assert_eq!(lines_of(&f, &shuffled), order);

        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, lines_of(&f, &base));
    }

    #[test]
    fn test_negative_filter_narrows() {
        let f = fixture();
        let base = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#));
        let filtered = base.clone().then(QueryOperation::Filter(FilterArgs::cql(r#"[word="the"]"#, [-5, 5], true)));

        let all = f.calc.compute(&TaskContext::detached("t1"), &base).unwrap().size;
        let kept = f.calc.compute(&TaskContext::detached("t2"), &filtered).unwrap();
        assert!(kept.size <= all);
        assert_eq!(kept.reused_ops, 1);
    }

    #[test]
    fn test_intermediate_prefix_stored() {
        let f = fixture();
        let sorted = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#)).then(QueryOperation::Sort(SortArgs {
            levels: vec![SortLevel {
                attr: "word".into(),
                ctx: SortContext::Left,
                ignore_case: true,
                backward: false,
            }],
        }));
        let sampled = sorted.clone().then(QueryOperation::Sample(SampleArgs { rlines: 2 }));

        assert_eq!(f.calc.compute(&TaskContext::detached("t1"), &sampled).unwrap().size, 2);
        let key = CacheKey::from_chain(&sorted).unwrap();
        assert_eq!(f.calc.flight.map.get_stored_size(&key).unwrap(), Some(4));
    }

    #[test]
    fn test_switch_main_corpus() {
        let f = fixture();
        let chain = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#))
            .with_aligned("cs")
            .then(QueryOperation::SwitchMainCorp(SwitchMainArgs { maincorp: "cs".into() }));
        let outcome = f.calc.compute(&TaskContext::detached("t1"), &chain).unwrap();
        assert_eq!(outcome.size, 4);
    }

    #[test]
    fn test_unknown_corpus_is_bad_input() {
        let f = fixture();
        let chain = QueryChain::new("nope", QueryArgs::cql(r#"[word="dog"]"#));
        let err = f.calc.compute(&TaskContext::detached("t1"), &chain).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadInput);
        let key = CacheKey::from_chain(&chain).unwrap();
        assert!(f.calc.flight.map.get_entry(&key).unwrap().is_none());
    }

    #[test]
    fn test_unavailable_aligned_corpus() {
        let f = fixture();
        f.engine.set_available("cs", false);
        let chain = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#)).with_aligned("cs");
        let err = f.calc.compute(&TaskContext::detached("t1"), &chain).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlignedCorpusUnavailable);
    }

    #[test]
    fn test_cancelled_run_leaves_nothing_published() {
        let f = fixture();
        let chain = QueryChain::new("en", QueryArgs::cql(r#"[word="dog"]"#));
        let ctx = TaskContext::detached("t1");
        ctx.cancel.revoke();
        assert_eq!(f.calc.compute(&ctx, &chain).unwrap_err().kind, ErrorKind::Cancelled);
        let key = CacheKey::from_chain(&chain).unwrap();
        assert!(f.calc.flight.map.get_entry(&key).unwrap().is_none());
    }
}
