use std::num::NonZeroUsize;
use std::sync::Arc;
use lru::LruCache;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{all_consuming, map, map_res, opt, value};
use nom::multi::{many1, separated_list1};
use nom::sequence::{delimited, preceded};
use nom::{IResult, Parser};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use crate::core::error::{Error, ErrorKind, Result};

/// Largest `{n,m}` repetition accepted
pub const MAX_REPEAT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// Test applied to a single corpus position
#[derive(Debug, Clone, PartialEq)]
pub enum PosExpr {
    Any,
    /// `attr = "re"`; `None` means the query's default attribute
    Attr { attr: Option<String>, op: CmpOp, value: String },
    And(Vec<PosExpr>),
    Or(Vec<PosExpr>),
    Not(Box<PosExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPattern {
    pub expr: PosExpr,
    pub min: u32,
    pub max: u32,
}

/// Parsed CQL: a sequence of position patterns
#[derive(Debug, Clone, PartialEq)]
pub struct CqlQuery {
    pub tokens: Vec<TokenPattern>,
}

/// Subset of CQL understood here:
/// `[attr="re" & attr!="re" | !(...)]`, `"re"`, `[]`, quantifiers `?` and `{n,m}`
pub fn parse_cql(input: &str) -> Result<CqlQuery> {
    let tokens = match all_consuming(many1(ws(token))).parse(input) {
        Ok((_, tokens)) => tokens,
        Err(e) => {
            return Err(Error::new(
                ErrorKind::BadInput,
                format!("invalid CQL {:?}: {}", input, e),
            ));
        }
    };

    for t in &tokens {
        if t.min > t.max || t.max > MAX_REPEAT {
            return Err(Error::new(
                ErrorKind::BadInput,
                format!("invalid repetition {{{},{}}} in {:?}", t.min, t.max, input),
            ));
        }
    }
    if tokens.iter().all(|t| t.min == 0) {
        return Err(Error::new(
            ErrorKind::BadInput,
            format!("query {:?} can match an empty sequence", input),
        ));
    }
    Ok(CqlQuery { tokens })
}

/// Simple query: each word must equal the corresponding token literally
pub fn simple_query(input: &str, attr: &str) -> Result<CqlQuery> {
    let tokens: Vec<TokenPattern> = input
        .split_whitespace()
        .map(|word| TokenPattern {
            expr: PosExpr::Attr {
                attr: Some(attr.to_string()),
                op: CmpOp::Eq,
                value: regex::escape(word),
            },
            min: 1,
            max: 1,
        })
        .collect();

    if tokens.is_empty() {
        return Err(Error::new(ErrorKind::BadInput, "empty simple query".to_string()));
    }
    Ok(CqlQuery { tokens })
}

fn ws<'a, O, F>(inner: F) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
where
    F: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
{
    delimited(multispace0, inner, multispace0)
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_').parse(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(rest, nom::error::ErrorKind::Char)));
            }
            Some('"') => return Ok((chars.as_str(), out)),
            Some('\\') => match chars.next() {
                Some('"') => out.push('"'),
                // Everything else stays a regex escape
                Some(c) => {
                    out.push('\\');
                    out.push(c);
                }
                None => {
                    return Err(nom::Err::Error(nom::error::Error::new(rest, nom::error::ErrorKind::Escaped)));
                }
            },
            Some(c) => out.push(c),
        }
        rest = chars.as_str();
    }
}

fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>()).parse(input)
}

fn attr_test(input: &str) -> IResult<&str, PosExpr> {
    let (input, attr) = ws(ident).parse(input)?;
    let (input, op) = ws(alt((value(CmpOp::Ne, tag("!=")), value(CmpOp::Eq, tag("="))))).parse(input)?;
    let (input, value) = ws(quoted).parse(input)?;
    Ok((input, PosExpr::Attr { attr: Some(attr.to_string()), op, value }))
}

fn unary(input: &str) -> IResult<&str, PosExpr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| PosExpr::Not(Box::new(e))),
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        attr_test,
    ))
    .parse(input)
}

fn and_expr(input: &str) -> IResult<&str, PosExpr> {
    map(separated_list1(ws(char('&')), unary), |mut items| {
        if items.len() == 1 { items.remove(0) } else { PosExpr::And(items) }
    })
    .parse(input)
}

fn or_expr(input: &str) -> IResult<&str, PosExpr> {
    map(separated_list1(ws(char('|')), and_expr), |mut items| {
        if items.len() == 1 { items.remove(0) } else { PosExpr::Or(items) }
    })
    .parse(input)
}

fn position(input: &str) -> IResult<&str, PosExpr> {
    alt((
        map(delimited(ws(char('[')), opt(or_expr), char(']')), |e| e.unwrap_or(PosExpr::Any)),
        map(quoted, |value| PosExpr::Attr { attr: None, op: CmpOp::Eq, value }),
    ))
    .parse(input)
}

fn quantifier(input: &str) -> IResult<&str, (u32, u32)> {
    alt((
        value((0, 1), char('?')),
        delimited(char('{'), (number, opt(preceded(char(','), number))), char('}'))
            .map(|(min, max)| (min, max.unwrap_or(min))),
    ))
    .parse(input)
}

fn token(input: &str) -> IResult<&str, TokenPattern> {
    (position, opt(quantifier))
        .map(|(expr, q)| {
            let (min, max) = q.unwrap_or((1, 1));
            TokenPattern { expr, min, max }
        })
        .parse(input)
}

/// Positional attribute lookup used while matching
pub trait TokenSource {
    fn len(&self) -> u64;

    fn attr_index(&self, name: &str) -> Option<usize>;

    fn attr_value(&self, pos: u64, attr: usize) -> &str;
}

#[derive(Debug, Clone)]
pub enum CompiledTest {
    Any,
    Attr { attr: usize, negated: bool, regex: Arc<Regex> },
    And(Vec<CompiledTest>),
    Or(Vec<CompiledTest>),
    Not(Box<CompiledTest>),
}

impl CompiledTest {
    pub fn matches<S: TokenSource + ?Sized>(&self, source: &S, pos: u64) -> bool {
        match self {
            CompiledTest::Any => true,
            CompiledTest::Attr { attr, negated, regex } => {
                regex.is_match(source.attr_value(pos, *attr)) != *negated
            }
            CompiledTest::And(items) => items.iter().all(|t| t.matches(source, pos)),
            CompiledTest::Or(items) => items.iter().any(|t| t.matches(source, pos)),
            CompiledTest::Not(inner) => !inner.matches(source, pos),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledToken {
    pub test: CompiledTest,
    pub min: u32,
    pub max: u32,
}

/// CQL bound to the attributes of one corpus
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub tokens: Vec<CompiledToken>,
}

impl CompiledQuery {
    pub fn compile<S: TokenSource + ?Sized>(
        query: &CqlQuery,
        default_attr: &str,
        match_case: bool,
        source: &S,
        regexes: &RegexCache,
    ) -> Result<Self> {
        let tokens = query
            .tokens
            .iter()
            .map(|t| {
                Ok(CompiledToken {
                    test: compile_expr(&t.expr, default_attr, match_case, source, regexes)?,
                    min: t.min,
                    max: t.max,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledQuery { tokens })
    }

    /// Length of the shortest match starting at `start` that stays below `end`
    pub fn match_at<S: TokenSource + ?Sized>(&self, source: &S, start: u64, end: u64) -> Option<u64> {
        self.match_from(source, 0, start, end).map(|stop| stop - start)
    }

    fn match_from<S: TokenSource + ?Sized>(&self, source: &S, idx: usize, pos: u64, end: u64) -> Option<u64> {
        if idx == self.tokens.len() {
            return Some(pos);
        }
        let tok = &self.tokens[idx];

        let mut cur = pos;
        for _ in 0..tok.min {
            if cur >= end || !tok.test.matches(source, cur) {
                return None;
            }
            cur += 1;
        }

        let mut taken = tok.min;
        loop {
            if let Some(stop) = self.match_from(source, idx + 1, cur, end) {
                return Some(stop);
            }
            if taken >= tok.max || cur >= end || !tok.test.matches(source, cur) {
                return None;
            }
            cur += 1;
            taken += 1;
        }
    }

    /// True if the query matches anywhere in `[start, end)`
    pub fn matches_within<S: TokenSource + ?Sized>(&self, source: &S, start: u64, end: u64) -> bool {
        (start..end).any(|pos| self.match_at(source, pos, end).is_some())
    }
}

fn compile_expr<S: TokenSource + ?Sized>(
    expr: &PosExpr,
    default_attr: &str,
    match_case: bool,
    source: &S,
    regexes: &RegexCache,
) -> Result<CompiledTest> {
    Ok(match expr {
        PosExpr::Any => CompiledTest::Any,
        PosExpr::Attr { attr, op, value } => {
            let name = attr.as_deref().unwrap_or(default_attr);
            let index = source.attr_index(name).ok_or_else(|| {
                Error::new(ErrorKind::BadInput, format!("unknown attribute '{}'", name))
            })?;
            CompiledTest::Attr {
                attr: index,
                negated: *op == CmpOp::Ne,
                regex: regexes.get(value, match_case)?,
            }
        }
        PosExpr::And(items) => CompiledTest::And(
            items
                .iter()
                .map(|e| compile_expr(e, default_attr, match_case, source, regexes))
                .collect::<Result<Vec<_>>>()?,
        ),
        PosExpr::Or(items) => CompiledTest::Or(
            items
                .iter()
                .map(|e| compile_expr(e, default_attr, match_case, source, regexes))
                .collect::<Result<Vec<_>>>()?,
        ),
        PosExpr::Not(inner) => {
            CompiledTest::Not(Box::new(compile_expr(inner, default_attr, match_case, source, regexes)?))
        }
    })
}

/// Compiled regular expressions shared by all queries of an engine
pub struct RegexCache {
    pub cache: Mutex<LruCache<(String, bool), Arc<Regex>>>,
}

impl RegexCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        RegexCache {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Whole-value match, case-insensitive unless `match_case`
    pub fn get(&self, pattern: &str, match_case: bool) -> Result<Arc<Regex>> {
        let key = (pattern.to_string(), match_case);
        if let Some(regex) = self.cache.lock().get(&key) {
            return Ok(regex.clone());
        }

        let regex = Arc::new(
            RegexBuilder::new(&format!("^(?:{})$", pattern))
                .case_insensitive(!match_case)
                .build()?,
        );
        self.cache.lock().put(key, regex.clone());
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }
}
