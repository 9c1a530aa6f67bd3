//! Label selectors (`app=web,tier!=db,env in (prod,staging),!canary`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Requirement {
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str);
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // Missing keys satisfy negative requirements.
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
            Requirement::In(k, vs) => get(k).map(|x| vs.iter().any(|v| v == x)).unwrap_or(false),
            Requirement::NotIn(k, vs) => get(k).map(|x| vs.iter().all(|v| v != x)).unwrap_or(true),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
        }
    }
}

/// Conjunction of requirements; the empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.reqs.is_empty() }

    pub fn with(mut self, req: Requirement) -> Self {
        self.reqs.push(req);
        self
    }

    pub fn requirements(&self) -> &[Requirement] { &self.reqs }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut reqs = Vec::new();
        for term in split_top_level(s)? {
            let term = term.trim();
            if term.is_empty() { continue; }
            reqs.push(parse_term(term)?);
        }
        Ok(Self { reqs })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

// Commas inside `(...)` belong to set values, not to the conjunction.
fn split_top_level(s: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| Error::InvalidSelector(format!("unbalanced ')' in {:?}", s)))?;
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 { return Err(Error::InvalidSelector(format!("unbalanced '(' in {:?}", s))); }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some(k) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key(k)?));
    }
    if let Some((k, set)) = term.split_once(" notin ") {
        return Ok(Requirement::NotIn(key(k)?, values(set)?));
    }
    if let Some((k, set)) = term.split_once(" in ") {
        return Ok(Requirement::In(key(k)?, values(set)?));
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(key(k)?, v.trim().to_string()));
    }
    Ok(Requirement::Exists(key(term)?))
}

fn key(k: &str) -> Result<String> {
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) || k.contains(['(', ')', '=', '!']) {
        return Err(Error::InvalidSelector(format!("invalid label key {:?}", k)));
    }
    Ok(k.to_string())
}

fn values(set: &str) -> Result<Vec<String>> {
    let inner = set
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::InvalidSelector(format!("expected (v1,v2) got {:?}", set)))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_all_operators() {
        let s = Selector::parse("app=web, tier!=db,env in (prod, staging),track notin (canary),owner,!legacy").unwrap();
        assert_eq!(s.requirements().len(), 6);
        assert_eq!(s.requirements()[2], Requirement::In("env".into(), vec!["prod".into(), "staging".into()]));
        assert_eq!(s.to_string(), "app=web,tier!=db,env in (prod,staging),track notin (canary),owner,!legacy");
    }

    #[test]
    fn matching_follows_label_semantics() {
        let s = Selector::parse("app=web,tier!=db,!legacy").unwrap();
        assert!(s.matches(Some(&labels(&[("app", "web")]))));
        assert!(!s.matches(Some(&labels(&[("app", "web"), ("tier", "db")]))));
        assert!(!s.matches(Some(&labels(&[("app", "web"), ("legacy", "1")]))));
        assert!(!s.matches(None));
        assert!(Selector::everything().matches(None));
        let s = Selector::parse("env notin (prod)").unwrap();
        assert!(s.matches(None));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Selector::parse("env in (a,b").is_err());
        assert!(Selector::parse("=x").is_err());
        assert!(Selector::parse("env in a,b").is_err());
        assert!(Selector::parse("").unwrap().is_everything());
    }
}
