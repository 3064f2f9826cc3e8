pub mod cql;
pub mod memory;

use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::query::operation::{FilterArgs, QueryArgs, SortArgs};

/// One concordance row: KWIC with its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcLine {
    pub position: u64,              // Corpus position of the first KWIC token
    pub kwic_len: u32,
    pub left: Vec<String>,
    pub kwic: Vec<String>,
    pub right: Vec<String>,
    pub aligned: Vec<AlignedSegment>,
    pub group: Option<u16>,
}

/// Text of the aligned corpus segment matching a line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedSegment {
    pub corpname: String,
    pub text: String,
}

/// Opened corpus (or subcorpus of one)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusHandle {
    pub name: String,
    pub subcorpus: Option<String>,
    pub size: u64,
}

/// A concordance owned by the engine. `advance` drives the search
/// incrementally so that the caller can publish progress in between.
pub trait Concordance: Send {
    /// Lines found so far
    fn size(&self) -> u64;

    fn finished(&self) -> bool;

    /// Continue matching for a while. Returns true once the search is done.
    fn advance(&mut self) -> Result<bool>;

    /// Materialized lines `[from, to)`
    fn lines(&self, from: u64, to: u64) -> Result<Vec<ConcLine>>;

    fn filter(&mut self, args: &FilterArgs) -> Result<()>;

    fn sort(&mut self, args: &SortArgs) -> Result<()>;

    /// Keep a random subset of `rlines` lines, in original order
    fn sample(&mut self, rlines: usize, seed: u64) -> Result<()>;

    fn shuffle(&mut self, seed: u64) -> Result<()>;

    /// Make an aligned corpus the primary one
    fn switch_main(&mut self, corpname: &str) -> Result<()>;

    fn set_groups(&mut self, groups: &[(u64, u16)]) -> Result<()>;
}

/// Corpus engine collaborator
pub trait CorpusEngine: Send + Sync {
    fn open_corpus(&self, name: &str) -> Result<CorpusHandle>;

    fn open_subcorpus(&self, corpus: &CorpusHandle, name: &str) -> Result<CorpusHandle>;

    /// False for corpora that are registered but currently unusable
    fn is_available(&self, name: &str) -> bool;

    fn run_query(
        &self,
        corpus: &CorpusHandle,
        aligned: &[CorpusHandle],
        args: &QueryArgs,
    ) -> Result<Box<dyn Concordance>>;

    /// Rebuild a concordance from previously stored lines
    fn restore(
        &self,
        corpus: &CorpusHandle,
        aligned: &[CorpusHandle],
        lines: Vec<ConcLine>,
    ) -> Result<Box<dyn Concordance>>;
}
