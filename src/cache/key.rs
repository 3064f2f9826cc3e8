use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use crate::core::error::Result;
use crate::query::chain::{QueryChain, SubcorpusRef};

/// Longest file-name slug derived from a key
pub const MAX_SLUG_LEN: usize = 15;
pub const DEFAULT_SLUG: &str = "conc";

/// Fingerprint of (corpus, subcorpus name, subcorpus definition)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubcorpusHash(pub [u8; 8]);

impl SubcorpusHash {
    pub fn compute(corpname: &str, subcorpus: &SubcorpusRef) -> Self {
        let mut data = Vec::with_capacity(corpname.len() + subcorpus.name.len() + subcorpus.definition.len() + 2);
        data.extend_from_slice(corpname.as_bytes());
        data.push(0);
        data.extend_from_slice(subcorpus.name.as_bytes());
        data.push(0);
        data.extend_from_slice(subcorpus.definition.as_bytes());

        let digest = md5::compute(&data).0;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        SubcorpusHash(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for SubcorpusHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identity of a cache entry: corpus, subcorpus and the serialized operations.
/// `q[0]` also carries the ordered aligned corpora.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub corpname: String,
    pub subchash: Option<SubcorpusHash>,
    pub q: Vec<String>,
}

impl CacheKey {
    pub fn from_chain(chain: &QueryChain) -> Result<Self> {
        let mut q = Vec::with_capacity(chain.operations.len());
        for (i, op) in chain.operations.iter().enumerate() {
            if i == 0 {
                let head = json!({
                    "aligned": chain.aligned,
                    "op": serde_json::to_value(op)?,
                });
                q.push(serde_json::to_string(&head)?);
            } else {
                q.push(op.canonical_json()?);
            }
        }

        Ok(CacheKey {
            corpname: chain.corpname.clone(),
            subchash: chain
                .subcorpus
                .as_ref()
                .map(|s| SubcorpusHash::compute(&chain.corpname, s)),
            q,
        })
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Key of the first `n` operations
    pub fn prefix(&self, n: usize) -> CacheKey {
        CacheKey {
            corpname: self.corpname.clone(),
            subchash: self.subchash,
            q: self.q[..n.min(self.q.len())].to_vec(),
        }
    }

    /// The initial query alone
    pub fn base(&self) -> CacheKey {
        self.prefix(1)
    }

    /// Same subcorpus and same initial query
    pub fn shares_base(&self, other: &CacheKey) -> bool {
        self.corpname == other.corpname
            && self.subchash == other.subchash
            && self.q.first() == other.q.first()
    }

    /// Alphanumerics of each operation (type initial plus query text), truncated
    pub fn slug_base(&self) -> String {
        let mut slug: String = self
            .q
            .iter()
            .map(|q| op_slug(q))
            .collect::<String>()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        slug.truncate(MAX_SLUG_LEN);
        if slug.is_empty() {
            DEFAULT_SLUG.to_string()
        } else {
            slug
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.subchash {
            Some(hash) => write!(f, "{}/{}:{}", self.corpname, hash, self.slug_base()),
            None => write!(f, "{}:{}", self.corpname, self.slug_base()),
        }
    }
}

fn op_slug(q: &str) -> String {
    let value: Value = serde_json::from_str(q).unwrap_or(Value::Null);
    let op = value.get("op").unwrap_or(&value);

    let mut out = String::new();
    if let Some(initial) = op.get("form_type").and_then(Value::as_str).and_then(|s| s.chars().next()) {
        out.push(initial);
    }
    if let Some(query) = op.get("query").and_then(Value::as_str) {
        out.push_str(query);
    }
    out
}
