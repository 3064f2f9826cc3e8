use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use rayon::prelude::*;
use crate::core::error::{Error, ErrorKind, Result};
use crate::engine::cql::{parse_cql, simple_query, CompiledQuery, RegexCache, TokenSource};
use crate::engine::{AlignedSegment, ConcLine, Concordance, CorpusEngine, CorpusHandle};
use crate::query::operation::{FilterAnchor, FilterArgs, QueryArgs, QueryType, SortArgs, SortContext};

pub const DEFAULT_ATTRS: [&str; 3] = ["word", "lemma", "tag"];

/// Small tokenized corpus held in memory.
/// Sentences of aligned corpora correspond by index.
#[derive(Debug, Clone)]
pub struct MemoryCorpus {
    pub name: String,
    pub attrs: Vec<String>,
    pub values: Vec<Vec<String>>,       // values[attr][position]
    pub sentences: Vec<(u64, u64)>,     // [start, end) per sentence
}

impl MemoryCorpus {
    /// One sentence per line, tokens separated by whitespace,
    /// each token either `word` or `word/lemma/tag`
    pub fn from_text(name: &str, text: &str) -> Self {
        let attrs: Vec<String> = DEFAULT_ATTRS.iter().map(|a| a.to_string()).collect();
        let mut values = vec![Vec::new(); attrs.len()];
        let mut sentences = Vec::new();

        for line in text.lines() {
            let start = values[0].len() as u64;
            for raw in line.split_whitespace() {
                let mut parts = raw.splitn(3, '/');
                let word = parts.next().unwrap_or(raw).to_string();
                let lemma = parts.next().map(str::to_string).unwrap_or_else(|| word.to_lowercase());
                let tag = parts.next().unwrap_or("X").to_string();
                values[0].push(word);
                values[1].push(lemma);
                values[2].push(tag);
            }
            let end = values[0].len() as u64;
            if end > start {
                sentences.push((start, end));
            }
        }

        MemoryCorpus {
            name: name.to_string(),
            attrs,
            values,
            sentences,
        }
    }

    pub fn size(&self) -> u64 {
        self.values.first().map(|v| v.len() as u64).unwrap_or(0)
    }

    /// Empty past the end of the corpus
    pub fn word(&self, pos: u64) -> &str {
        self.attr_value(pos, 0)
    }

    pub fn sentence_of(&self, pos: u64) -> usize {
        self.sentences.partition_point(|s| s.1 <= pos)
    }

    pub fn sentence_bounds(&self, idx: usize) -> Option<(u64, u64)> {
        self.sentences.get(idx).copied()
    }

    pub fn sentence_text(&self, idx: usize) -> String {
        match self.sentence_bounds(idx) {
            Some((start, end)) => (start..end).map(|p| self.word(p)).collect::<Vec<_>>().join(" "),
            None => String::new(),
        }
    }
}

impl TokenSource for MemoryCorpus {
    fn len(&self) -> u64 {
        self.size()
    }

    fn attr_index(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a == name)
    }

    fn attr_value(&self, pos: u64, attr: usize) -> &str {
        self.values
            .get(attr)
            .and_then(|v| v.get(pos as usize))
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hit {
    position: u64,
    len: u64,
    group: Option<u16>,
}

struct AlignedRestriction {
    corpus: Arc<MemoryCorpus>,
    query: CompiledQuery,
    negated: bool,
}

/// Pending part of a running search
struct Search {
    query: CompiledQuery,
    restrictions: Vec<AlignedRestriction>,
    ranges: Vec<(u64, u64)>,
    range_idx: usize,
    next_pos: u64,
}

pub struct MemoryConcordance {
    main: Arc<MemoryCorpus>,
    aligned: Vec<Arc<MemoryCorpus>>,
    hits: Vec<Hit>,
    search: Option<Search>,
    regexes: Arc<RegexCache>,
    unavailable: Arc<RwLock<HashSet<String>>>,
    chunk_size: usize,
    step_delay: Option<Duration>,
    context: u64,
}

impl MemoryConcordance {
    fn check_aligned(&self) -> Result<()> {
        let unavailable = self.unavailable.read();
        for corpus in &self.aligned {
            if unavailable.contains(&corpus.name) {
                return Err(Error::new(
                    ErrorKind::AlignedCorpusUnavailable,
                    format!("aligned corpus '{}' is not available", corpus.name),
                ));
            }
        }
        Ok(())
    }

    fn ready(&self) -> Result<()> {
        if self.search.is_some() {
            return Err(Error::new(
                ErrorKind::Internal,
                "concordance is still being computed".to_string(),
            ));
        }
        self.check_aligned()
    }

    fn compile(&self, query_type: QueryType, query: &str, attr: &str, match_case: bool) -> Result<CompiledQuery> {
        compile_for(&self.main, query_type, query, attr, match_case, &self.regexes)
    }

    fn materialize(&self, hit: &Hit) -> ConcLine {
        let size = self.main.size();
        // restored hits may point past a corpus that has since shrunk
        let start = hit.position.min(size);
        let kwic_end = (start + hit.len).min(size);
        let left_start = start.saturating_sub(self.context);
        let right_end = (kwic_end + self.context).min(size);
        let words = |from: u64, to: u64| (from..to).map(|p| self.main.word(p).to_string()).collect::<Vec<_>>();

        let sentence = self.main.sentence_of(start);
        ConcLine {
            position: hit.position,
            kwic_len: hit.len as u32,
            left: words(left_start, start),
            kwic: words(start, kwic_end),
            right: words(kwic_end, right_end),
            aligned: self
                .aligned
                .iter()
                .map(|c| AlignedSegment {
                    corpname: c.name.clone(),
                    text: c.sentence_text(sentence),
                })
                .collect(),
            group: hit.group,
        }
    }

    fn sort_key(&self, hit: &Hit, args: &SortArgs, attrs: &[usize]) -> Vec<Vec<String>> {
        let size = self.main.size();
        args.levels
            .iter()
            .zip(attrs)
            .map(|(level, &attr)| {
                let positions: Vec<u64> = match level.ctx {
                    SortContext::Kwic => (hit.position.min(size)..(hit.position + hit.len).min(size)).collect(),
                    SortContext::Left => {
                        let start = hit.position.min(size);
                        (start.saturating_sub(self.context)..start).rev().collect()
                    }
                    SortContext::Right => {
                        let start = hit.position + hit.len;
                        (start.min(size)..(start + self.context).min(size)).collect()
                    }
                };
                positions
                    .into_iter()
                    .map(|p| {
                        let mut v = self.main.attr_value(p, attr).to_string();
                        if level.ignore_case {
                            v = v.to_lowercase();
                        }
                        if level.backward {
                            v = v.chars().rev().collect();
                        }
                        v
                    })
                    .collect()
            })
            .collect()
    }
}

fn compile_for(
    corpus: &MemoryCorpus,
    query_type: QueryType,
    query: &str,
    attr: &str,
    match_case: bool,
    regexes: &RegexCache,
) -> Result<CompiledQuery> {
    let parsed = match query_type {
        QueryType::Simple => simple_query(query, attr)?,
        QueryType::Advanced => parse_cql(query)?,
    };
    CompiledQuery::compile(&parsed, attr, match_case, corpus, regexes)
}

impl Concordance for MemoryConcordance {
    fn size(&self) -> u64 {
        self.hits.len() as u64
    }

    fn finished(&self) -> bool {
        self.search.is_none()
    }

    fn advance(&mut self) -> Result<bool> {
        self.check_aligned()?;
        let Some(search) = self.search.as_mut() else {
            return Ok(true);
        };

        let mut budget = self.chunk_size;
        while budget > 0 && search.range_idx < search.ranges.len() {
            let (_, range_end) = search.ranges[search.range_idx];
            if search.next_pos >= range_end {
                search.range_idx += 1;
                if let Some(&(start, _)) = search.ranges.get(search.range_idx) {
                    search.next_pos = start;
                }
                continue;
            }

            let pos = search.next_pos;
            if let Some(len) = search.query.match_at(self.main.as_ref(), pos, range_end) {
                let sentence = self.main.sentence_of(pos);
                let keep = search.restrictions.iter().all(|r| {
                    let found = match r.corpus.sentence_bounds(sentence) {
                        Some((start, end)) => r.query.matches_within(r.corpus.as_ref(), start, end),
                        None => false,
                    };
                    found != r.negated
                });
                if keep {
                    self.hits.push(Hit { position: pos, len, group: None });
                }
            }
            search.next_pos += 1;
            budget -= 1;
        }

        if search.range_idx >= search.ranges.len() {
            self.search = None;
            return Ok(true);
        }
        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }
        Ok(false)
    }

    fn lines(&self, from: u64, to: u64) -> Result<Vec<ConcLine>> {
        let to = to.min(self.size());
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self.hits[from as usize..to as usize].iter().map(|h| self.materialize(h)).collect())
    }

    fn filter(&mut self, args: &FilterArgs) -> Result<()> {
        self.ready()?;
        let query = self.compile(args.query_type, &args.query, &args.default_attr, args.match_case)?;
        let size = self.main.size() as i64;
        let main = self.main.clone();

        self.hits.retain(|hit| {
            let anchor = match args.anchor {
                FilterAnchor::First => hit.position as i64,
                FilterAnchor::Last => (hit.position + hit.len) as i64 - 1,
            };
            let from = (anchor + args.window[0] as i64).max(0);
            let to = (anchor + args.window[1] as i64).min(size - 1);
            let kwic = hit.position as i64..(hit.position + hit.len) as i64;

            let found = (from..=to)
                .filter(|p| args.include_kwic || !kwic.contains(p))
                .any(|p| query.match_at(main.as_ref(), p as u64, size as u64).is_some());
            found != args.negated
        });
        Ok(())
    }

    fn sort(&mut self, args: &SortArgs) -> Result<()> {
        self.ready()?;
        let attrs = args
            .levels
            .iter()
            .map(|level| {
                self.main.attr_index(&level.attr).ok_or_else(|| {
                    Error::new(ErrorKind::BadInput, format!("unknown sort attribute '{}'", level.attr))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut keyed: Vec<(Vec<Vec<String>>, Hit)> =
            self.hits.iter().map(|h| (self.sort_key(h, args, &attrs), *h)).collect();
        keyed.par_sort_by(|a, b| a.0.cmp(&b.0).then(a.1.position.cmp(&b.1.position)));
        self.hits = keyed.into_iter().map(|(_, h)| h).collect();
        Ok(())
    }

    fn sample(&mut self, rlines: usize, seed: u64) -> Result<()> {
        self.ready()?;
        if rlines >= self.hits.len() {
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = index::sample(&mut rng, self.hits.len(), rlines).into_vec();
        picked.sort_unstable();
        self.hits = picked.into_iter().map(|i| self.hits[i]).collect();
        Ok(())
    }

    fn shuffle(&mut self, seed: u64) -> Result<()> {
        self.ready()?;
        let mut rng = StdRng::seed_from_u64(seed);
        self.hits.shuffle(&mut rng);
        Ok(())
    }

    fn switch_main(&mut self, corpname: &str) -> Result<()> {
        self.ready()?;
        if self.main.name == corpname {
            return Ok(());
        }
        let idx = self.aligned.iter().position(|c| c.name == corpname).ok_or_else(|| {
            Error::new(
                ErrorKind::AlignedCorpusUnavailable,
                format!("corpus '{}' is not aligned with '{}'", corpname, self.main.name),
            )
        })?;

        let new_main = self.aligned.remove(idx);
        let old_main = std::mem::replace(&mut self.main, new_main);
        self.hits = self
            .hits
            .iter()
            .filter_map(|hit| {
                let sentence = old_main.sentence_of(hit.position);
                self.main.sentence_bounds(sentence).map(|(start, end)| Hit {
                    position: start,
                    len: end - start,
                    group: hit.group,
                })
            })
            .collect();
        self.aligned.insert(0, old_main);
        Ok(())
    }

    fn set_groups(&mut self, groups: &[(u64, u16)]) -> Result<()> {
        self.ready()?;
        let by_position: HashMap<u64, u16> = groups.iter().copied().collect();
        for hit in &mut self.hits {
            if let Some(&group) = by_position.get(&hit.position) {
                hit.group = Some(group);
            }
        }
        Ok(())
    }
}

/// Reference engine over in-memory corpora
pub struct MemoryCorpusEngine {
    pub corpora: RwLock<HashMap<String, Arc<MemoryCorpus>>>,
    pub subcorpora: RwLock<HashMap<(String, String), Vec<(u64, u64)>>>,
    pub unavailable: Arc<RwLock<HashSet<String>>>,
    pub regexes: Arc<RegexCache>,
    pub chunk_size: usize,          // Start positions examined per `advance`
    pub step_delay: Option<Duration>,
    pub context: u64,               // Tokens of left/right context
    pub queries_run: AtomicU64,
    pub restores: AtomicU64,
}

impl MemoryCorpusEngine {
    pub fn new() -> Self {
        MemoryCorpusEngine {
            corpora: RwLock::new(HashMap::new()),
            subcorpora: RwLock::new(HashMap::new()),
            unavailable: Arc::new(RwLock::new(HashSet::new())),
            regexes: Arc::new(RegexCache::new(256)),
            chunk_size: 4096,
            step_delay: None,
            context: 5,
            queries_run: AtomicU64::new(0),
            restores: AtomicU64::new(0),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleep between chunks; lets tests observe a long-running search
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn register(&self, corpus: MemoryCorpus) {
        self.corpora.write().insert(corpus.name.clone(), Arc::new(corpus));
    }

    pub fn register_text(&self, name: &str, text: &str) {
        self.register(MemoryCorpus::from_text(name, text));
    }

    pub fn register_subcorpus(&self, corpname: &str, name: &str, ranges: Vec<(u64, u64)>) {
        self.subcorpora
            .write()
            .insert((corpname.to_string(), name.to_string()), ranges);
    }

    pub fn set_available(&self, name: &str, available: bool) {
        let mut unavailable = self.unavailable.write();
        if available {
            unavailable.remove(name);
        } else {
            unavailable.insert(name.to_string());
        }
    }

    fn corpus(&self, name: &str) -> Result<Arc<MemoryCorpus>> {
        self.corpora
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("corpus '{}' not found", name)))
    }

    fn aligned_corpora(&self, aligned: &[CorpusHandle]) -> Result<Vec<Arc<MemoryCorpus>>> {
        aligned
            .iter()
            .map(|handle| {
                if !self.is_available(&handle.name) {
                    return Err(Error::new(
                        ErrorKind::AlignedCorpusUnavailable,
                        format!("aligned corpus '{}' is not available", handle.name),
                    ));
                }
                self.corpus(&handle.name)
            })
            .collect()
    }

    fn concordance(&self, main: Arc<MemoryCorpus>, aligned: Vec<Arc<MemoryCorpus>>) -> MemoryConcordance {
        MemoryConcordance {
            main,
            aligned,
            hits: Vec::new(),
            search: None,
            regexes: self.regexes.clone(),
            unavailable: self.unavailable.clone(),
            chunk_size: self.chunk_size,
            step_delay: self.step_delay,
            context: self.context,
        }
    }
}

impl Default for MemoryCorpusEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CorpusEngine for MemoryCorpusEngine {
    fn open_corpus(&self, name: &str) -> Result<CorpusHandle> {
        let corpus = self.corpus(name)?;
        Ok(CorpusHandle {
            name: name.to_string(),
            subcorpus: None,
            size: corpus.size(),
        })
    }

    fn open_subcorpus(&self, corpus: &CorpusHandle, name: &str) -> Result<CorpusHandle> {
        let subcorpora = self.subcorpora.read();
        let ranges = subcorpora.get(&(corpus.name.clone(), name.to_string())).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("subcorpus '{}' of '{}' not found", name, corpus.name),
            )
        })?;
        Ok(CorpusHandle {
            name: corpus.name.clone(),
            subcorpus: Some(name.to_string()),
            size: ranges.iter().map(|(s, e)| e.saturating_sub(*s)).sum(),
        })
    }

    fn is_available(&self, name: &str) -> bool {
        self.corpora.read().contains_key(name) && !self.unavailable.read().contains(name)
    }

    fn run_query(
        &self,
        corpus: &CorpusHandle,
        aligned: &[CorpusHandle],
        args: &QueryArgs,
    ) -> Result<Box<dyn Concordance>> {
        let main = self.corpus(&corpus.name)?;
        let aligned = self.aligned_corpora(aligned)?;

        let query = compile_for(&main, args.query_type, &args.query, &args.default_attr, args.match_case, &self.regexes)?;
        let restrictions = args
            .aligned_queries
            .iter()
            .map(|aq| {
                let target = aligned.iter().find(|c| c.name == aq.corpname).cloned().ok_or_else(|| {
                    Error::new(
                        ErrorKind::AlignedCorpusUnavailable,
                        format!("aligned corpus '{}' is not attached", aq.corpname),
                    )
                })?;
                let query = compile_for(&target, aq.query_type, &aq.query, &aq.default_attr, aq.match_case, &self.regexes)?;
                Ok(AlignedRestriction { corpus: target, query, negated: aq.negated })
            })
            .collect::<Result<Vec<_>>>()?;

        let ranges = match &corpus.subcorpus {
            Some(name) => {
                let subcorpora = self.subcorpora.read();
                let mut ranges = subcorpora
                    .get(&(corpus.name.clone(), name.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::NotFound, format!("subcorpus '{}' not found", name))
                    })?;
                ranges.sort_unstable();
                ranges
            }
            None => vec![(0, main.size())],
        };

        self.queries_run.fetch_add(1, Ordering::Relaxed);
        let mut conc = self.concordance(main, aligned);
        conc.search = Some(Search {
            query,
            restrictions,
            next_pos: ranges.first().map(|r| r.0).unwrap_or(0),
            ranges,
            range_idx: 0,
        });
        Ok(Box::new(conc))
    }

    fn restore(
        &self,
        corpus: &CorpusHandle,
        aligned: &[CorpusHandle],
        lines: Vec<ConcLine>,
    ) -> Result<Box<dyn Concordance>> {
        let main = self.corpus(&corpus.name)?;
        let aligned = self.aligned_corpora(aligned)?;

        self.restores.fetch_add(1, Ordering::Relaxed);
        let mut conc = self.concordance(main, aligned);
        conc.hits = lines
            .into_iter()
            .map(|line| Hit {
                position: line.position,
                len: line.kwic_len as u64,
                group: line.group,
            })
            .collect();
        Ok(Box::new(conc))
    }
}
