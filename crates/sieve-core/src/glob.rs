//! Glob patterns over forward-slash separated paths.
//!
//! Matching is case-sensitive and segment based:
//! - `**` as a whole segment spans zero or more segments,
//! - `*` matches any run of characters inside one segment, `?` exactly one,
//! - a path pattern without wildcards also matches everything below it,
//!   so `app` covers `app` and `app/templates/index.hbs`.
//!
//! Branch patterns use the same syntax without the directory-prefix rule.

use crate::{Error, Result};
use regex::Regex;
use std::fmt;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a pattern for matching file paths.
    pub fn path(pattern: &str) -> Result<Self> {
        Self::compile(pattern, true)
    }

    /// Compile a pattern for matching branch or ref names.
    pub fn branch(pattern: &str) -> Result<Self> {
        Self::compile(pattern, false)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check whether a path (or branch name) matches.
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(normalize_path(text))
    }

    fn compile(pattern: &str, directory_prefix: bool) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidGlob {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.starts_with('!') {
            return Err(invalid("negated patterns are not supported"));
        }

        let mut body = normalize_path(pattern.trim()).to_string();
        if body.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if body.ends_with('/') {
            body.push_str("**");
        }

        let segments: Vec<&str> = body.split('/').collect();
        let mut expr = String::from("^");
        for (idx, segment) in segments.iter().enumerate() {
            let last = idx + 1 == segments.len();
            if *segment == "**" {
                if last {
                    expr.push_str(".*");
                } else {
                    expr.push_str("(?:[^/]+/)*");
                }
                continue;
            }
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if segment.contains("**") {
                return Err(invalid("`**` must be a whole path segment"));
            }
            for ch in segment.chars() {
                match ch {
                    '*' => expr.push_str("[^/]*"),
                    '?' => expr.push_str("[^/]"),
                    other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
                }
            }
            if !last {
                expr.push('/');
            }
        }

        let has_wildcard = body.contains('*') || body.contains('?');
        if directory_prefix && !has_wildcard {
            expr.push_str("(?:/.*)?");
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.regex.as_str() == other.regex.as_str()
    }
}

impl Eq for GlobPattern {}

/// Strip a leading `./` or `/` so that repository-relative paths compare equal.
pub fn normalize_path(path: &str) -> &str {
    let path = path.strip_prefix("./").unwrap_or(path);
    path.trim_start_matches('/')
}
