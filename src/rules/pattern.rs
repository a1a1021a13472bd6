// src/rules/pattern.rs

use std::fmt;

use crate::error::{RateLimiterError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum MethodMatcher {
    Any,
    Exact(String),
}

/// Matcher for one path segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentMatcher {
    Literal(String),
    /// A bare `*`
    Any,
    /// Literal pieces separated by `*`, e.g. `v*` or `*.json`
    Glob(Vec<String>),
}

impl SegmentMatcher {
    fn compile(segment: &str) -> Self {
        if segment == "*" {
            Self::Any
        } else if segment.contains('*') {
            Self::Glob(segment.split('*').map(str::to_string).collect())
        } else {
            Self::Literal(segment.to_string())
        }
    }

    fn matches(&self, segment: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == segment,
            Self::Any => true,
            Self::Glob(pieces) => glob_matches(pieces, segment),
        }
    }
}

/// `pieces` came from splitting on `*`, so there are at least two of them
fn glob_matches(pieces: &[String], segment: &str) -> bool {
    let (first, rest) = match pieces.split_first() {
        Some(split) => split,
        None => return false,
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return segment == first,
    };

    if segment.len() < first.len() + last.len()
        || !segment.starts_with(first.as_str())
        || !segment.ends_with(last.as_str())
    {
        return false;
    }

    let mut remaining = &segment[first.len()..segment.len() - last.len()];
    for piece in middle {
        match remaining.find(piece.as_str()) {
            Some(at) => remaining = &remaining[at + piece.len()..],
            None => return false,
        }
    }
    true
}

/// Path segments of a request path, ignoring query, fragment and empty segments
fn request_segments(path: &str) -> impl Iterator<Item = &str> {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    path[..end].split('/').filter(|segment| !segment.is_empty())
}

/// A compiled `"[METHOD] /path/with/*"` pattern.
///
/// `*` (or no method) matches any method. In the path, `*` matches within a
/// single segment and never crosses `/`. Trailing slashes are ignored on both
/// sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPattern {
    source: String,
    method: MethodMatcher,
    segments: Vec<SegmentMatcher>,
}

impl EndpointPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            RateLimiterError::Config(format!("invalid endpoint pattern '{}': {}", pattern, reason))
        };

        let mut parts = pattern.split_whitespace();
        let (method, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(path), None, None) if path.starts_with('/') => (MethodMatcher::Any, path),
            (Some(method), Some(path), None) => {
                let method = if method == "*" {
                    MethodMatcher::Any
                } else if method.chars().all(|c| c.is_ascii_alphabetic()) {
                    MethodMatcher::Exact(method.to_ascii_uppercase())
                } else {
                    return Err(invalid("method must be a word or '*'"));
                };
                (method, path)
            }
            (None, _, _) => return Err(invalid("empty pattern")),
            _ => return Err(invalid("expected '[METHOD] /path'")),
        };

        if !path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        if path.contains(['?', '#']) {
            return Err(invalid("query strings and fragments are not matched"));
        }

        let trimmed = path.trim_end_matches('/');
        let mut segments = Vec::new();
        if !trimmed.is_empty() {
            for segment in trimmed[1..].split('/') {
                if segment.is_empty() {
                    return Err(invalid("empty path segment"));
                }
                segments.push(SegmentMatcher::compile(segment));
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            method,
            segments,
        })
    }

    /// The pattern text as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let MethodMatcher::Exact(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }

        let mut matchers = self.segments.iter();
        for segment in request_segments(path) {
            match matchers.next() {
                Some(matcher) if matcher.matches(segment) => {}
                _ => return false,
            }
        }
        matchers.next().is_none()
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
