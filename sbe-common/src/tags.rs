//! Device tags and the tag-query language.
//!
//! A tag is either a bare `value` or a `key=value` pair. Queries are boolean
//! expressions over tag predicates, used by dynamic groups and device list
//! filters:
//!
//! ```text
//! expr      := term ( ('AND' | 'OR') term )*
//! term      := predicate | '(' expr ')' | 'NOT' predicate
//! predicate := atom | atom '=' value
//! atom      := [a-z0-9_-]+
//! value     := [a-z0-9_\-*]+
//! ```
//!
//! AND binds tighter than OR. `*` in a predicate value matches any sequence.
//! Atoms and values are lower-cased and trimmed before evaluation; the
//! keywords `and`, `or`, `not` are reserved. The parser is total: invalid
//! input fails `INVALID_TAG_QUERY` with the offending byte position.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, ErrorCode};

/// A canonical device tag: lower-cased, trimmed, no wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagAtom {
    key: Option<String>,
    value: String,
}

impl TagAtom {
    /// Parse and canonicalize a tag. Wildcards are rejected here; they are
    /// legal only in query predicates.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(invalid_tag(raw, "empty tag"));
        }
        let (key, value) = match trimmed.split_once('=') {
            Some((k, v)) => (Some(k.trim().to_string()), v.trim().to_string()),
            None => (None, trimmed.clone()),
        };
        if let Some(k) = &key {
            if !is_atom(k) {
                return Err(invalid_tag(raw, "tag key must match [a-z0-9_-]+"));
            }
        }
        if !is_atom(&value) {
            return Err(invalid_tag(raw, "tag value must match [a-z0-9_-]+"));
        }
        Ok(Self { key, value })
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for TagAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(k) => write!(f, "{}={}", k, self.value),
            None => f.write_str(&self.value),
        }
    }
}

impl TryFrom<String> for TagAtom {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TagAtom> for String {
    fn from(tag: TagAtom) -> Self {
        tag.to_string()
    }
}

fn invalid_tag(raw: &str, why: &str) -> CoreError {
    CoreError::new(ErrorCode::InvalidTagQuery, format!("invalid tag {raw:?}: {why}"))
        .with_details(serde_json::json!({ "input": raw }))
}

fn is_atom(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

fn is_value(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-' || b == b'*'
        })
}

/// One predicate of a tag query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPredicate {
    /// Present for `key=value` predicates, absent for bare ones.
    pub key: Option<String>,
    /// May contain `*` wildcards.
    pub value: String,
}

impl TagPredicate {
    /// Whether this predicate matches a single device tag.
    ///
    /// A bare device tag matches any predicate key if its value matches; a
    /// bare predicate matches any device tag key.
    pub fn matches_tag(&self, tag: &TagAtom) -> bool {
        match (&self.key, tag.key()) {
            (Some(pk), Some(tk)) if pk != tk => false,
            _ => wildcard_match(&self.value, tag.value()),
        }
    }
}

/// Match `pattern` (with `*` wildcards) against `input` in full.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    // Iterative glob over bytes; only `*` is special.
    let p = pattern.as_bytes();
    let s = input.as_bytes();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((sp, ss)) = star {
            pi = sp + 1;
            si = ss + 1;
            star = Some((sp, ss + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Parsed tag-query expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagQuery {
    And(Box<TagQuery>, Box<TagQuery>),
    Or(Box<TagQuery>, Box<TagQuery>),
    Not(TagPredicate),
    Predicate(TagPredicate),
}

impl TagQuery {
    /// Parse a query string into an expression tree.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0, input };
        let expr = parser.or_expr()?;
        if parser.pos < parser.tokens.len() {
            let tok = &parser.tokens[parser.pos];
            return Err(parse_error(input, tok.offset, "unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate the query against a device's tag set.
    pub fn matches<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a TagAtom> + Clone,
    {
        match self {
            Self::And(a, b) => a.matches(tags.clone()) && b.matches(tags),
            Self::Or(a, b) => a.matches(tags.clone()) || b.matches(tags),
            Self::Not(p) => !tags.into_iter().any(|t| p.matches_tag(t)),
            Self::Predicate(p) => tags.into_iter().any(|t| p.matches_tag(t)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    LParen,
    RParen,
    And,
    Or,
    Not,
    /// `atom` or `atom=value`.
    Word { atom: String, value: Option<String> },
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn parse_error(input: &str, offset: usize, why: &str) -> CoreError {
    CoreError::new(
        ErrorCode::InvalidTagQuery,
        format!("invalid tag query at byte {offset}: {why}"),
    )
    .with_details(serde_json::json!({ "input": input, "position": offset }))
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: i });
                i += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: i });
                i += 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && !matches!(bytes[i], b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')') {
                    i += 1;
                }
                let word = &input[start..i];
                let lowered = word.to_ascii_lowercase();
                let kind = match lowered.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    _ => {
                        let (atom, value) = match lowered.split_once('=') {
                            Some((a, v)) => (a.to_string(), Some(v.to_string())),
                            None => (lowered.clone(), None),
                        };
                        if !is_atom(&atom) {
                            return Err(parse_error(
                                input,
                                start,
                                "atom must match [a-z0-9_-]+",
                            ));
                        }
                        if let Some(v) = &value {
                            if !is_value(v) {
                                return Err(parse_error(
                                    input,
                                    start,
                                    "value must match [a-z0-9_*-]+",
                                ));
                            }
                        }
                        TokenKind::Word { atom, value }
                    }
                };
                tokens.push(Token { kind, offset: start });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    input: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or_else(|| self.input.len())
    }

    // or_expr := and_expr ('OR' and_expr)*
    fn or_expr(&mut self) -> Result<TagQuery, CoreError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(TokenKind::Or)) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = TagQuery::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and_expr := term ('AND' term)*
    fn and_expr(&mut self) -> Result<TagQuery, CoreError> {
        let mut left = self.term()?;
        while matches!(self.peek(), Some(TokenKind::And)) {
            self.pos += 1;
            let right = self.term()?;
            left = TagQuery::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // term := predicate | '(' expr ')' | 'NOT' predicate
    fn term(&mut self) -> Result<TagQuery, CoreError> {
        match self.peek() {
            Some(TokenKind::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                match self.peek() {
                    Some(TokenKind::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(parse_error(self.input, self.offset(), "expected ')'")),
                }
            }
            Some(TokenKind::Not) => {
                self.pos += 1;
                let pred = self.predicate()?;
                Ok(TagQuery::Not(pred))
            }
            Some(TokenKind::Word { .. }) => Ok(TagQuery::Predicate(self.predicate()?)),
            _ => Err(parse_error(self.input, self.offset(), "expected predicate or '('")),
        }
    }

    fn predicate(&mut self) -> Result<TagPredicate, CoreError> {
        match self.peek().cloned() {
            Some(TokenKind::Word { atom, value }) => {
                self.pos += 1;
                match value {
                    Some(v) => Ok(TagPredicate { key: Some(atom), value: v }),
                    None => Ok(TagPredicate { key: None, value: atom }),
                }
            }
            _ => Err(parse_error(self.input, self.offset(), "expected predicate")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn tags(raw: &[&str]) -> BTreeSet<TagAtom> {
        raw.iter().map(|t| TagAtom::parse(t).unwrap()).collect()
    }

    fn eval(query: &str, device_tags: &[&str]) -> bool {
        TagQuery::parse(query).unwrap().matches(&tags(device_tags))
    }

    #[test]
    fn atom_canonicalization() {
        let tag = TagAtom::parse("  Env=Production  ").unwrap();
        assert_eq!(tag.key(), Some("env"));
        assert_eq!(tag.value(), "production");
        assert_eq!(tag.to_string(), "env=production");

        let bare = TagAtom::parse("GPU").unwrap();
        assert_eq!(bare.key(), None);
        assert_eq!(bare.value(), "gpu");
    }

    #[test]
    fn atom_rejects_wildcards_and_bad_chars() {
        assert!(TagAtom::parse("env=prod*").is_err());
        assert!(TagAtom::parse("spaced tag").is_err());
        assert!(TagAtom::parse("").is_err());
        assert!(TagAtom::parse("=x").is_err());
        assert!(TagAtom::parse("k=").is_err());
    }

    #[test]
    fn simple_predicates() {
        assert!(eval("production", &["production"]));
        assert!(eval("env=production", &["env=production"]));
        assert!(!eval("env=production", &["env=staging"]));
        assert!(!eval("production", &["staging"]));
    }

    #[test]
    fn bare_device_tag_matches_any_key() {
        // A bare tag `production` matches `production` or any `<k>=production`.
        assert!(eval("env=production", &["production"]));
        assert!(eval("region=production", &["production"]));
    }

    #[test]
    fn bare_predicate_matches_any_device_key() {
        assert!(eval("production", &["env=production"]));
        assert!(!eval("production", &["env=staging"]));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a OR b AND c == a OR (b AND c)
        let q = "alpha OR beta AND gamma";
        assert!(eval(q, &["alpha"]));
        assert!(eval(q, &["beta", "gamma"]));
        assert!(!eval(q, &["beta"]));
        assert!(!eval(q, &["gamma"]));
    }

    #[test]
    fn parentheses_override_precedence() {
        let q = "(alpha OR beta) AND gamma";
        assert!(!eval(q, &["alpha"]));
        assert!(eval(q, &["alpha", "gamma"]));
        assert!(eval(q, &["beta", "gamma"]));
    }

    #[test]
    fn not_negates_a_predicate() {
        assert!(eval("NOT decommissioned", &["production"]));
        assert!(!eval("NOT decommissioned", &["decommissioned"]));
        assert!(eval("production AND NOT canary", &["production"]));
        assert!(!eval("production AND NOT canary", &["production", "canary"]));
    }

    #[test]
    fn wildcards_match_sequences() {
        assert!(eval("env=prod*", &["env=production"]));
        assert!(eval("env=prod*", &["env=prod"]));
        assert!(!eval("env=prod*", &["env=staging"]));
        assert!(eval("region=*-east-*", &["region=us-east-1"]));
        assert!(eval("*", &["anything"]));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert!(eval("alpha and beta", &["alpha", "beta"]));
        assert!(eval("alpha Or beta", &["beta"]));
        assert!(eval("nOt alpha", &["beta"]));
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = TagQuery::parse("env=prod AND (").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTagQuery);
        let details = err.details.unwrap();
        assert_eq!(details["position"], 14);

        let err = TagQuery::parse("env=Bad!Char").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTagQuery);

        let err = TagQuery::parse("a b").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTagQuery);

        let err = TagQuery::parse("").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTagQuery);
    }

    #[test]
    fn not_applies_to_predicate_only() {
        // `NOT (a AND b)` is outside the grammar.
        assert!(TagQuery::parse("NOT (alpha AND beta)").is_err());
    }

    #[test]
    fn wildcard_matcher_edge_cases() {
        assert!(wildcard_match("", ""));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("**", "x"));
        assert!(!wildcard_match("a*b", "acbd"));
        assert!(wildcard_match("a*b", "acb"));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn atom_strategy() -> impl Strategy<Value = String> {
            "[a-z0-9_-]{1,12}".prop_filter("reserved", |s| {
                !matches!(s.as_str(), "and" | "or" | "not")
            })
        }

        proptest! {
            #[test]
            fn every_valid_atom_parses(atom in atom_strategy(), value in atom_strategy()) {
                let bare = TagAtom::parse(&atom).unwrap();
                prop_assert_eq!(bare.value(), atom.as_str());
                let pair = TagAtom::parse(&format!("{atom}={value}")).unwrap();
                prop_assert_eq!(pair.key(), Some(atom.as_str()));
            }

            #[test]
            fn parser_never_panics(input in ".{0,64}") {
                let _ = TagQuery::parse(&input);
            }

            #[test]
            fn self_equality_predicate_matches(atom in atom_strategy(), value in atom_strategy()) {
                let query = format!("{atom}={value}");
                let tag = TagAtom::parse(&query).unwrap();
                let parsed = TagQuery::parse(&query).unwrap();
                prop_assert!(parsed.matches(std::iter::once(&tag).collect::<Vec<_>>()));
            }
        }
    }
}
