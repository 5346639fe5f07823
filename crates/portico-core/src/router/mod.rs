//! Path-pattern routing: compiled patterns, most-specific-wins, memoized.
//!
//! Patterns come in three shapes:
//!
//! - glob style: `*` matches within one path segment (`[^/]*`), `**` matches
//!   across segments (`.*`), `?` matches one character
//! - explicit regex: anything starting with `^` is used verbatim
//! - literal: everything else must match exactly
//!
//! When several patterns match a path, the winner is decided by (1) longest
//! literal prefix, (2) fewest wildcards, (3) declaration order. Resolution is
//! cached in a bounded LRU keyed by `(method, path)`; the router is immutable
//! after construction, so a config reload builds a fresh router and the LRU
//! never holds stale entries.

use std::num::NonZeroUsize;

use http::Method;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;

const RESOLUTION_CACHE_SIZE: usize = 4096;

/// Pattern compilation failures, reported at config load time.
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A single compiled route pattern.
#[derive(Debug)]
struct CompiledPattern {
    source: String,
    regex: Regex,
    /// Number of literal characters before the first wildcard.
    literal_prefix_len: usize,
    /// Count of wildcard tokens (`*`, `**`, `?` each count once).
    wildcard_count: usize,
}

fn glob_meta(c: char) -> bool {
    matches!(c, '*' | '?' | '[')
}

/// Translates a glob pattern into an anchored regex source.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push('.'),
            other => {
                if regex_syntax_meta(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }
    out.push('$');
    out
}

fn regex_syntax_meta(c: char) -> bool {
    matches!(c, '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\')
}

fn count_wildcards(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                }
                count += 1;
            }
            '?' => count += 1,
            _ => {}
        }
    }
    count
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Result<Self, PatternError> {
        let (regex_source, literal_prefix_len, wildcard_count) = if pattern.starts_with('^') {
            // Explicit regex: specificity counts characters before the first
            // metacharacter, skipping the anchor.
            let body = &pattern[1..];
            let prefix = body.chars().take_while(|c| !regex_syntax_meta(*c) && !glob_meta(*c));
            (pattern.to_string(), prefix.count(), count_wildcards(pattern))
        } else if pattern.contains(['*', '?', '[']) {
            let prefix = pattern.chars().take_while(|c| !glob_meta(*c));
            (glob_to_regex(pattern), prefix.count(), count_wildcards(pattern))
        } else {
            (format!("^{}$", regex::escape(pattern)), pattern.len(), 0)
        };

        let regex = Regex::new(&regex_source)
            .map_err(|source| PatternError::Invalid { pattern: pattern.to_string(), source })?;
        Ok(Self { source: pattern.to_string(), regex, literal_prefix_len, wildcard_count })
    }

    fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Compiled pattern set mapping paths to a policy payload.
///
/// `T` is whatever the caller attaches to each pattern (the gateway uses its
/// compiled feature set). The router itself is immutable; swap the whole
/// router to change routes.
pub struct PathRouter<T> {
    patterns: Vec<(CompiledPattern, T)>,
    resolutions: Mutex<LruCache<(Method, String), Option<usize>>>,
}

impl<T> PathRouter<T> {
    /// Compiles `routes` in declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first [`PatternError`] encountered; config loading treats
    /// this as fatal.
    pub fn new(routes: Vec<(String, T)>) -> Result<Self, PatternError> {
        let mut patterns = Vec::with_capacity(routes.len());
        for (pattern, payload) in routes {
            patterns.push((CompiledPattern::compile(&pattern)?, payload));
        }
        let capacity =
            NonZeroUsize::new(RESOLUTION_CACHE_SIZE).expect("cache size is non-zero");
        Ok(Self { patterns, resolutions: Mutex::new(LruCache::new(capacity)) })
    }

    /// Resolves `path` to the most specific matching pattern's payload.
    ///
    /// Returns the pattern source alongside the payload so callers can key
    /// throttle buckets and telemetry by the matched pattern.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<(&str, &T)> {
        let cache_key = (method.clone(), path.to_string());
        if let Some(cached) = self.resolutions.lock().get(&cache_key) {
            return cached.map(|index| {
                let (pattern, payload) = &self.patterns[index];
                (pattern.source.as_str(), payload)
            });
        }

        let winner = self.match_uncached(path);
        self.resolutions.lock().put(cache_key, winner);
        winner.map(|index| {
            let (pattern, payload) = &self.patterns[index];
            (pattern.source.as_str(), payload)
        })
    }

    fn match_uncached(&self, path: &str) -> Option<usize> {
        let mut best: Option<(usize, usize, usize)> = None; // (index, prefix, wildcards)
        for (index, (pattern, _)) in self.patterns.iter().enumerate() {
            if !pattern.matches(path) {
                continue;
            }
            let candidate = (index, pattern.literal_prefix_len, pattern.wildcard_count);
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    // Longest literal prefix wins, then fewest wildcards,
                    // then declaration order (the earlier index).
                    let (c_idx, c_prefix, c_wild) = current;
                    let (n_idx, n_prefix, n_wild) = candidate;
                    if n_prefix > c_prefix ||
                        (n_prefix == c_prefix && n_wild < c_wild) ||
                        (n_prefix == c_prefix && n_wild == c_wild && n_idx < c_idx)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        best.map(|(index, _, _)| index)
    }

    /// Number of compiled patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Standalone single-pattern matcher, shared with the RBAC route table.
///
/// # Errors
///
/// Returns [`PatternError`] when the pattern does not compile.
pub fn compile_matcher(pattern: &str) -> Result<impl Fn(&str) -> bool, PatternError> {
    let compiled = CompiledPattern::compile(pattern)?;
    Ok(move |path: &str| compiled.matches(path))
}
