use std::collections::HashSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::UserId;
use crate::query::operation::{QueryArgs, QueryOperation};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubcorpusRef {
    pub name: String,
    /// Whatever identifies the subcorpus content (a query, a text-type selection, a path)
    pub definition: String,
}

/// Ordered operations over a primary corpus, its optional subcorpus
/// and the aligned corpora (in declared order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryChain {
    pub corpname: String,
    #[serde(default)]
    pub subcorpus: Option<SubcorpusRef>,
    #[serde(default)]
    pub aligned: Vec<String>,
    pub operations: Vec<QueryOperation>,
}

impl QueryChain {
    pub fn new(corpname: &str, query: QueryArgs) -> Self {
        QueryChain {
            corpname: corpname.to_string(),
            subcorpus: None,
            aligned: Vec::new(),
            operations: vec![QueryOperation::Query(query)],
        }
    }

    pub fn with_aligned(mut self, corpname: &str) -> Self {
        self.aligned.push(corpname.to_string());
        self
    }

    pub fn with_subcorpus(mut self, name: &str, definition: &str) -> Self {
        self.subcorpus = Some(SubcorpusRef {
            name: name.to_string(),
            definition: definition.to_string(),
        });
        self
    }

    pub fn then(mut self, op: QueryOperation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// The chain made of the first `n` operations
    pub fn prefix(&self, n: usize) -> QueryChain {
        QueryChain {
            corpname: self.corpname.clone(),
            subcorpus: self.subcorpus.clone(),
            aligned: self.aligned.clone(),
            operations: self.operations[..n.min(self.operations.len())].to_vec(),
        }
    }

    pub fn query(&self) -> Option<&QueryArgs> {
        match self.operations.first() {
            Some(QueryOperation::Query(args)) => Some(args),
            _ => None,
        }
    }

    /// Primary corpus after the first `n` operations (`switchmc` changes it)
    pub fn main_corpus_after(&self, n: usize) -> &str {
        self.operations[..n.min(self.operations.len())]
            .iter()
            .rev()
            .find_map(|op| match op {
                QueryOperation::SwitchMainCorp(args) => Some(args.maincorp.as_str()),
                _ => None,
            })
            .unwrap_or(self.corpname.as_str())
    }

    /// Sorted keys, no whitespace. Byte equality of this string is chain equality.
    pub fn canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let chain: QueryChain = serde_json::from_str(data)?;
        chain.validate()?;
        Ok(chain)
    }

    pub fn validate(&self) -> Result<()> {
        if self.corpname.is_empty() {
            return Err(bad("chain has no corpus"));
        }
        if self.operations.is_empty() {
            return Err(bad("chain has no operations"));
        }
        if !matches!(self.operations[0], QueryOperation::Query(_)) {
            return Err(bad("chain must start with a query"));
        }

        let mut seen = HashSet::new();
        for corp in &self.aligned {
            if corp.is_empty() || *corp == self.corpname || !seen.insert(corp.as_str()) {
                return Err(Error::new(
                    ErrorKind::BadInput,
                    format!("invalid aligned corpus '{}'", corp),
                ));
            }
        }

        for (i, op) in self.operations.iter().enumerate() {
            op.validate()?;
            match op {
                QueryOperation::Query(args) if i == 0 => {
                    for aq in &args.aligned_queries {
                        if !seen.contains(aq.corpname.as_str()) {
                            return Err(Error::new(
                                ErrorKind::BadInput,
                                format!("query refers to undeclared aligned corpus '{}'", aq.corpname),
                            ));
                        }
                    }
                }
                QueryOperation::Query(_) => {
                    return Err(Error::new(ErrorKind::BadInput, format!("unexpected query at step {}", i)));
                }
                QueryOperation::SwitchMainCorp(args) => {
                    if args.maincorp != self.corpname && !seen.contains(args.maincorp.as_str()) {
                        return Err(Error::new(
                            ErrorKind::BadInput,
                            format!("cannot switch to undeclared corpus '{}'", args.maincorp),
                        ));
                    }
                }
                QueryOperation::Locked(_) if i + 1 != self.operations.len() => {
                    return Err(bad("nothing may follow a locked step"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn bad(msg: &str) -> Error {
    Error::new(ErrorKind::BadInput, msg.to_string())
}

/// A persisted chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryChainRecord {
    pub id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub num_access: u64,
    pub data: QueryChain,
    pub archived: bool,
}

impl QueryChainRecord {
    pub fn new(id: String, user_id: UserId, data: QueryChain) -> Self {
        let now = Utc::now();
        QueryChainRecord {
            id,
            user_id,
            created_at: now,
            last_access_at: now,
            num_access: 0,
            data,
            archived: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access_at = Utc::now();
        self.num_access += 1;
    }
}
