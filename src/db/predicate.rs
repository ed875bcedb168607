//! Tag-equality predicates for time-series queries and deletes.
//!
//! Constraints are kept structured until the last moment: the SQLite store
//! binds values as parameters, and the text rendering escapes quotes, so a
//! tag value can never change the shape of a predicate.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::StoreError;

fn tag_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Whether `key` is usable as a tag name.
pub fn is_valid_tag_key(key: &str) -> bool {
    tag_key_pattern().is_match(key)
}

/// A list of `(tag, value)` equality constraints joined by AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    constraints: Vec<(String, String)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality constraint.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.push((key.into(), value.into()));
        self
    }

    /// Add a constraint only when `value` is present and non-empty.
    ///
    /// An absent filter is left out of the predicate rather than matched as
    /// an empty string, so rows written without that tag still match.
    pub fn tag_opt(self, key: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => self.tag(key, v),
            _ => self,
        }
    }

    pub fn constraints(&self) -> &[(String, String)] {
        &self.constraints
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Reject tag keys that are not plain identifiers.
    pub fn validate(&self) -> Result<(), StoreError> {
        for (key, _) in &self.constraints {
            if !is_valid_tag_key(key) {
                return Err(StoreError::InvalidTag(key.clone()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.constraints.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{}=\"{}\"", key, escape_value(value))?;
        }
        Ok(())
    }
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
