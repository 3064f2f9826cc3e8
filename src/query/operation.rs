use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};

/// One step of a query chain, tagged by `form_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form_type")]
pub enum QueryOperation {
    #[serde(rename = "query")]
    Query(QueryArgs),
    #[serde(rename = "filter")]
    Filter(FilterArgs),
    #[serde(rename = "sort")]
    Sort(SortArgs),
    #[serde(rename = "sample")]
    Sample(SampleArgs),
    #[serde(rename = "shuffle")]
    Shuffle(ShuffleArgs),
    #[serde(rename = "switchmc")]
    SwitchMainCorp(SwitchMainArgs),
    #[serde(rename = "lgroup")]
    LinesGroup(LinesGroupArgs),
    #[serde(rename = "locked")]
    Locked(LockedArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Whitespace separated words matched against `default_attr`
    Simple,
    /// CQL
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryArgs {
    pub query_type: QueryType,
    pub query: String,
    #[serde(default = "default_attr")]
    pub default_attr: String,
    #[serde(default)]
    pub match_case: bool,
    /// Restrictions on aligned corpora (parallel corpus queries)
    #[serde(default)]
    pub aligned_queries: Vec<AlignedQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedQuery {
    pub corpname: String,
    pub query_type: QueryType,
    pub query: String,
    #[serde(default = "default_attr")]
    pub default_attr: String,
    #[serde(default)]
    pub match_case: bool,
    /// Keep lines whose aligned segment does NOT match
    #[serde(default)]
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAnchor {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterArgs {
    pub query_type: QueryType,
    pub query: String,
    #[serde(default = "default_attr")]
    pub default_attr: String,
    #[serde(default)]
    pub match_case: bool,
    /// Negative filter removes matching lines
    #[serde(default)]
    pub negated: bool,
    /// Token window relative to the anchor, both ends inclusive
    pub window: [i32; 2],
    #[serde(default = "default_anchor")]
    pub anchor: FilterAnchor,
    #[serde(default = "default_true")]
    pub include_kwic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortContext {
    Kwic,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortLevel {
    pub attr: String,
    pub ctx: SortContext,
    #[serde(default)]
    pub ignore_case: bool,
    /// Compare reversed strings (sort by word endings)
    #[serde(default)]
    pub backward: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortArgs {
    pub levels: Vec<SortLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleArgs {
    pub rlines: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleArgs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchMainArgs {
    pub maincorp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineGroupAssignment {
    pub position: u64,
    pub group: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinesGroupArgs {
    pub groups: Vec<LineGroupAssignment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedArgs {}

fn default_attr() -> String {
    "word".to_string()
}

fn default_anchor() -> FilterAnchor {
    FilterAnchor::First
}

fn default_true() -> bool {
    true
}

impl QueryOperation {
    pub fn form_type(&self) -> &'static str {
        match self {
            QueryOperation::Query(_) => "query",
            QueryOperation::Filter(_) => "filter",
            QueryOperation::Sort(_) => "sort",
            QueryOperation::Sample(_) => "sample",
            QueryOperation::Shuffle(_) => "shuffle",
            QueryOperation::SwitchMainCorp(_) => "switchmc",
            QueryOperation::LinesGroup(_) => "lgroup",
            QueryOperation::Locked(_) => "locked",
        }
    }

    /// Canonical JSON: sorted keys, no whitespace
    pub fn canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }

    /// Checks that only depend on the operation itself
    pub fn validate(&self) -> Result<()> {
        match self {
            QueryOperation::Query(args) => {
                non_empty_query(&args.query, "query")?;
                for aligned in &args.aligned_queries {
                    non_empty_query(&aligned.query, "aligned query")?;
                }
            }
            QueryOperation::Filter(args) => {
                non_empty_query(&args.query, "filter")?;
                if args.window[0] > args.window[1] {
                    return Err(Error::new(
                        ErrorKind::BadInput,
                        format!("filter window [{}, {}] is inverted", args.window[0], args.window[1]),
                    ));
                }
            }
            QueryOperation::Sort(args) => {
                if args.levels.is_empty() {
                    return Err(Error::new(ErrorKind::BadInput, "sort needs at least one level".to_string()));
                }
                if args.levels.iter().any(|l| l.attr.is_empty()) {
                    return Err(Error::new(ErrorKind::BadInput, "sort attribute must not be empty".to_string()));
                }
            }
            QueryOperation::Sample(args) => {
                if args.rlines == 0 {
                    return Err(Error::new(ErrorKind::BadInput, "sample size must be positive".to_string()));
                }
            }
            QueryOperation::SwitchMainCorp(args) => {
                if args.maincorp.is_empty() {
                    return Err(Error::new(ErrorKind::BadInput, "switchmc needs a corpus".to_string()));
                }
            }
            QueryOperation::Shuffle(_) | QueryOperation::LinesGroup(_) | QueryOperation::Locked(_) => {}
        }
        Ok(())
    }
}

fn non_empty_query(query: &str, what: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::new(ErrorKind::BadInput, format!("{} must not be empty", what)));
    }
    Ok(())
}

impl QueryArgs {
    pub fn cql(query: &str) -> Self {
        QueryArgs {
            query_type: QueryType::Advanced,
            query: query.to_string(),
            default_attr: default_attr(),
            match_case: false,
            aligned_queries: Vec::new(),
        }
    }

    pub fn simple(query: &str) -> Self {
        QueryArgs {
            query_type: QueryType::Simple,
            ..QueryArgs::cql(query)
        }
    }
}

impl FilterArgs {
    pub fn cql(query: &str, window: [i32; 2], negated: bool) -> Self {
        FilterArgs {
            query_type: QueryType::Advanced,
            query: query.to_string(),
            default_attr: default_attr(),
            match_case: false,
            negated,
            window,
            anchor: FilterAnchor::First,
            include_kwic: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_type_tag_in_json() {
        let op = QueryOperation::Shuffle(ShuffleArgs {});
        assert_eq!(op.canonical_json().unwrap(), r#"{"form_type":"shuffle"}"#);

        let op = QueryOperation::Sample(SampleArgs { rlines: 5 });
        assert_eq!(op.canonical_json().unwrap(), r#"{"form_type":"sample","rlines":5}"#);
    }

    #[test]
    fn test_canonical_keys_sorted() {
        let op = QueryOperation::Query(QueryArgs::cql("[word=\"dog\"]"));
        let json = op.canonical_json().unwrap();
        assert!(json.starts_with(r#"{"aligned_queries":[],"default_attr":"word","form_type":"query""#));
    }

    #[test]
    fn test_defaults_filled_on_deserialize() {
        let op: QueryOperation = serde_json::from_str(
            r#"{"form_type":"filter","query_type":"advanced","query":"[word=\"cat\"]","window":[-5,5]}"#,
        ).unwrap();
        match op {
            QueryOperation::Filter(args) => {
                assert_eq!(args.default_attr, "word");
                assert!(!args.negated);
                assert!(args.include_kwic);
                assert_eq!(args.anchor, FilterAnchor::First);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_variant_is_bad_input() {
        let err: Error = serde_json::from_str::<QueryOperation>(r#"{"form_type":"pivot"}"#)
            .unwrap_err()
            .into();
        assert_eq!(err.kind, ErrorKind::BadInput);
    }

    #[test]
    fn test_inverted_window_rejected() {
        let op = QueryOperation::Filter(FilterArgs::cql("[word=\"cat\"]", [3, -3], false));
        assert_eq!(op.validate().unwrap_err().kind, ErrorKind::BadInput);
    }
}
