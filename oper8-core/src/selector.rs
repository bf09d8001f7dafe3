//! Label/field selector grammar, shared by the real and dry-run cluster adapters so the
//! two stay behaviorally identical: for any manifest and selector, both return the same
//! match decision.
//!
//! Grammar: comma-separated requirements (commas outside parentheses don't split). Each
//! requirement is one of `key`, `!key`, `key=v` / `key==v`, `key!=v`, `key in (v1,v2)`,
//! `key notin (v1,v2)`.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty requirement in selector")]
    EmptyRequirement,
    #[error("unterminated set expression in requirement: {0}")]
    UnterminatedSet(String),
    #[error("malformed requirement: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// `key` — key must be present.
    Exists(String),
    /// `!key` — key must be absent.
    NotExists(String),
    /// `key=v` / `key==v`.
    Equals(String, String),
    /// `key!=v`.
    NotEquals(String, String),
    /// `key in (v1,v2,...)`.
    In(String, Vec<String>),
    /// `key notin (v1,v2,...)`.
    NotIn(String, Vec<String>),
}

/// A parsed selector: an AND of [`Requirement`]s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    pub requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a selector string. An empty/whitespace-only string yields a selector that
    /// matches everything.
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let mut requirements = Vec::new();
        for clause in split_top_level_commas(raw) {
            let clause = clause.trim();
            if clause.is_empty() {
                return Err(SelectorError::EmptyRequirement);
            }
            requirements.push(parse_requirement(clause)?);
        }
        Ok(Self { requirements })
    }

    /// Evaluate this selector against a flat key/value map (e.g. a `labels` block).
    #[must_use]
    pub fn matches_map(&self, values: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| requirement_matches(r, |key| values.get(key).cloned()))
    }

    /// Evaluate this selector against a manifest, resolving each requirement's key as a
    /// dotted path into the document (e.g. `metadata.labels.app`).
    #[must_use]
    pub fn matches_manifest(&self, manifest: &Value) -> bool {
        self.requirements
            .iter()
            .all(|r| requirement_matches(r, |key| lookup_dotted(manifest, key)))
    }
}

fn requirement_matches(requirement: &Requirement, lookup: impl Fn(&str) -> Option<String>) -> bool {
    match requirement {
        Requirement::Exists(key) => lookup(key).is_some(),
        Requirement::NotExists(key) => lookup(key).is_none(),
        Requirement::Equals(key, v) => lookup(key).as_deref() == Some(v.as_str()),
        Requirement::NotEquals(key, v) => lookup(key).as_deref() != Some(v.as_str()),
        Requirement::In(key, set) => lookup(key).is_some_and(|actual| set.iter().any(|v| v == &actual)),
        Requirement::NotIn(key, set) => !lookup(key).is_some_and(|actual| set.iter().any(|v| v == &actual)),
    }
}

fn lookup_dotted(manifest: &Value, dotted_path: &str) -> Option<String> {
    let mut current = manifest;
    for segment in dotted_path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn split_top_level_commas(raw: &str) -> Vec<&str> {
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut parts = Vec::new();
    for (i, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn parse_requirement(clause: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = clause.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(SelectorError::Malformed(clause.to_string()));
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if let Some(rest) = clause.find(" in ").map(|i| (&clause[..i], &clause[i + 4..])) {
        let (key, set) = rest;
        return Ok(Requirement::In(key.trim().to_string(), parse_set(set, clause)?));
    }
    if let Some(rest) = clause.find(" notin ").map(|i| (&clause[..i], &clause[i + 7..])) {
        let (key, set) = rest;
        return Ok(Requirement::NotIn(key.trim().to_string(), parse_set(set, clause)?));
    }
    if let Some(idx) = clause.find("!=") {
        let (key, value) = (clause[..idx].trim(), clause[idx + 2..].trim());
        return Ok(Requirement::NotEquals(key.to_string(), value.to_string()));
    }
    if let Some(idx) = clause.find("==") {
        let (key, value) = (clause[..idx].trim(), clause[idx + 2..].trim());
        return Ok(Requirement::Equals(key.to_string(), value.to_string()));
    }
    if let Some(idx) = clause.find('=') {
        let (key, value) = (clause[..idx].trim(), clause[idx + 1..].trim());
        return Ok(Requirement::Equals(key.to_string(), value.to_string()));
    }
    let key = clause.trim();
    if key.is_empty() {
        return Err(SelectorError::Malformed(clause.to_string()));
    }
    Ok(Requirement::Exists(key.to_string()))
}

fn parse_set(raw: &str, clause: &str) -> Result<Vec<String>, SelectorError> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| SelectorError::UnterminatedSet(clause.to_string()))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn exists_and_not_exists() {
        let s = Selector::parse("app,!debug").unwrap();
        assert!(s.matches_map(&labels(&[("app", "x")])));
        assert!(!s.matches_map(&labels(&[("app", "x"), ("debug", "true")])));
    }

    #[test]
    fn equals_and_not_equals() {
        let s = Selector::parse("env=prod,tier!=cache").unwrap();
        assert!(s.matches_map(&labels(&[("env", "prod"), ("tier", "web")])));
        assert!(!s.matches_map(&labels(&[("env", "dev"), ("tier", "web")])));
        assert!(!s.matches_map(&labels(&[("env", "prod"), ("tier", "cache")])));
    }

    #[test]
    fn double_equals_is_accepted() {
        let s = Selector::parse("env==prod").unwrap();
        assert!(s.matches_map(&labels(&[("env", "prod")])));
    }

    #[test]
    fn in_and_notin_sets() {
        let s = Selector::parse("tier in (web,api)").unwrap();
        assert!(s.matches_map(&labels(&[("tier", "web")])));
        assert!(!s.matches_map(&labels(&[("tier", "cache")])));

        let s2 = Selector::parse("tier notin (cache,queue)").unwrap();
        assert!(s2.matches_map(&labels(&[("tier", "web")])));
        assert!(!s2.matches_map(&labels(&[("tier", "cache")])));
    }

    #[test]
    fn comma_inside_parens_is_not_a_split_point() {
        let s = Selector::parse("tier in (web,api),env=prod").unwrap();
        assert_eq!(s.requirements.len(), 2);
    }

    #[test]
    fn missing_key_semantics() {
        let not_exists = Selector::parse("!missing").unwrap();
        assert!(not_exists.matches_map(&labels(&[])));
        let exists = Selector::parse("missing").unwrap();
        assert!(!exists.matches_map(&labels(&[])));
        let eq = Selector::parse("missing=x").unwrap();
        assert!(!eq.matches_map(&labels(&[])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = Selector::parse("  ").unwrap();
        assert!(s.matches_map(&labels(&[])));
    }

    #[test]
    fn unterminated_set_is_an_error() {
        assert!(matches!(Selector::parse("tier in (web"), Err(SelectorError::UnterminatedSet(_))));
    }

    #[test]
    fn matches_manifest_via_dotted_path() {
        let manifest = serde_json::json!({"metadata": {"labels": {"app": "x"}}});
        let s = Selector::parse("metadata.labels.app=x").unwrap();
        assert!(s.matches_manifest(&manifest));
    }
}
