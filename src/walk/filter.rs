//! Include/exclude pattern matching for the source tree walk.
//!
//! Strives for parity with rsync's "Include/Exclude Pattern Rules" for
//! the subset of rules the publish pipeline supports.

use regex::Regex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("could not process pattern '{pattern}': {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    source: regex::Error,
}

/// A single compiled pattern.
#[derive(Debug)]
struct Pattern {
    raw: String,
    /// Pattern ended with `/`: only matches directories.
    dirs_only: bool,
    /// Compiled wildcard form; `None` means plain substring matching.
    re: Option<Regex>,
}

/// Converts an rsync-style wildcard pattern into an anchored regular
/// expression:
///
/// - `*` matches any run of characters stopping at `/`
/// - `?` matches a single character except `/`
/// - `**` (and `***`) match across `/`
/// - `[set]` passes through as a character class
/// - `\x` escapes a wildcard character
/// - `.` is always literal
fn make_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut converted = String::new();

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                // Escape; consumes the following wildcard character.
                i += 1;
                if let Some(&next) = chars.get(i) {
                    if matches!(next, '*' | '?' | '[' | ']') {
                        converted.push('\\');
                        converted.push(next);
                    }
                }
            }
            '.' => converted.push_str("\\."),
            '*' => converted.push_str("[^/]+"),
            '?' => converted.push_str("[^/]"),
            ch => converted.push(ch),
        }
        i += 1;
    }

    let converted = converted.replace("[^/]+[^/]+", ".*");

    Regex::new(&format!("^{converted}$"))
}

impl Pattern {
    fn compile(raw: &str) -> Result<Pattern, PatternError> {
        let mut pattern = raw;
        let dirs_only = pattern.ends_with('/');
        if dirs_only {
            pattern = pattern.trim_end_matches('/');
        }

        let re = if pattern.contains(['*', '?', '[', ']']) {
            Some(make_regex(pattern).map_err(|source| PatternError {
                pattern: raw.to_string(),
                source,
            })?)
        } else {
            None
        };

        Ok(Pattern {
            raw: pattern.to_string(),
            dirs_only,
            re,
        })
    }

    /// Determines whether the pattern matches the given relative path.
    fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.dirs_only && !is_dir {
            return false;
        }

        match &self.re {
            Some(re) => {
                // Wildcards are tried against each path component, then
                // against the full path.
                for component in split_after_slash(path) {
                    if re.is_match(component) {
                        return true;
                    }
                }
                re.is_match(path)
            }
            // Default to simple string matching.
            None => path.contains(&self.raw),
        }
    }
}

/// Splits a path after every `/`, keeping the separator attached to the
/// preceding component.
fn split_after_slash(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in path.char_indices() {
        if ch == '/' {
            out.push(&path[start..idx + 1]);
            start = idx + 1;
        }
    }
    out.push(&path[start..]);
    out
}

/// A compiled set of exclude and include patterns.
#[derive(Debug, Default)]
pub struct Matcher {
    excludes: Vec<Pattern>,
    includes: Vec<Pattern>,
}

impl Matcher {
    pub fn new(excludes: &[String], includes: &[String]) -> Result<Matcher, PatternError> {
        Ok(Matcher {
            excludes: excludes
                .iter()
                .map(|p| Pattern::compile(p))
                .collect::<Result<_, _>>()?,
            includes: includes
                .iter()
                .map(|p| Pattern::compile(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Decides whether the given relative path survives filtering.
    ///
    /// Excludes are tried first; an excluded path is rescued only if
    /// some include pattern matches it. The special include `*/`
    /// automatically rescues directories.
    pub fn keep(&self, path: &str, is_dir: bool) -> bool {
        for exclude in &self.excludes {
            if !exclude.matches(path, is_dir) {
                continue;
            }

            for include in &self.includes {
                if include.raw == "*" && include.dirs_only && include.re.is_some() {
                    // The "*/" include: rescues dirs, nothing else.
                    if is_dir {
                        return true;
                    }
                    continue;
                }

                if include.matches(path, is_dir) {
                    debug!(path, include = %include.raw, "path included");
                    return true;
                }
            }

            debug!(path, exclude = %exclude.raw, "path excluded");
            return false;
        }

        true
    }
}
