//! Precompiled stream-id patterns for subscriptions and queries.
//!
//! Glob semantics are deliberately small:
//!
//! - `*` alone matches every stream id.
//! - `prefix*` (a single trailing `*`) matches any id that starts with `prefix` and has at
//!   least one more character. The suffix may contain any characters, including further
//!   `-` separators, so `alert-*` matches `alert-1-a`.
//! - Anything without `*` is matched exactly.
//!
//! There is no multi-level (`**`) or infix wildcard; a `*` anywhere but the last character
//! is rejected when the pattern is compiled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Any,
    Prefix(String),
    Exact(String),
}

/// A compiled stream-id pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamPattern {
    source: String,
    matcher: Matcher,
}

impl StreamPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the pattern is empty or contains a `*` anywhere
    /// other than as its final character.
    pub fn compile(pattern: &str) -> Result<Self, Error> {
        if pattern.is_empty() {
            return Err(Error::Validation(
                "stream pattern must not be empty".to_string(),
            ));
        }
        let matcher = match pattern.strip_suffix('*') {
            Some("") => Matcher::Any,
            Some(prefix) if !prefix.contains('*') => Matcher::Prefix(prefix.to_string()),
            None if !pattern.contains('*') => Matcher::Exact(pattern.to_string()),
            _ => {
                return Err(Error::Validation(format!(
                    "stream pattern {pattern:?}: '*' is only allowed as the last character"
                )));
            }
        };
        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    /// The match-everything pattern `*`.
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            matcher: Matcher::Any,
        }
    }

    /// Returns `true` if `stream_id` matches this pattern.
    pub fn matches(&self, stream_id: &str) -> bool {
        match &self.matcher {
            Matcher::Any => true,
            Matcher::Prefix(prefix) => {
                stream_id.len() > prefix.len() && stream_id.starts_with(prefix.as_str())
            }
            Matcher::Exact(exact) => stream_id == exact,
        }
    }

    /// The pattern text as given to [`compile`](StreamPattern::compile).
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for StreamPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for StreamPattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StreamPattern::compile(&value)
    }
}

impl From<StreamPattern> for String {
    fn from(pattern: StreamPattern) -> Self {
        pattern.source
    }
}
