//! String matching for path and function filters
//!
//! A [`Matcher`] is a pattern compiled once at configuration-load time and
//! queried on the visit path. Three modes exist:
//!
//! - `Strict`: case-sensitive byte equality
//! - `Wildcard`: `*` matches any run of bytes, `?` matches exactly one
//! - `RegExp`: the `regex` crate dialect, unanchored
//!
//! Construction is the only fallible step; a malformed regular expression
//! becomes a configuration error. Matching itself is total and pure.

use regex::Regex;

/// The rule system used to compare a subject string against a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingMode {
    StrictMatch,
    WildcardMatch,
    RegExpMatch,
}

impl MatchingMode {
    /// Parse the `matchingmode` attribute value used in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "strict" => Some(MatchingMode::StrictMatch),
            "wildcard" => Some(MatchingMode::WildcardMatch),
            "regexp" => Some(MatchingMode::RegExpMatch),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MatchingMode::StrictMatch => "strict",
            MatchingMode::WildcardMatch => "wildcard",
            MatchingMode::RegExpMatch => "regexp",
        }
    }
}

#[derive(Debug, Clone)]
enum Compiled {
    Strict(String),
    Wildcard(String),
    RegExp(Regex),
}

/// A compiled (mode, pattern) pair.
#[derive(Debug, Clone)]
pub struct Matcher {
    compiled: Compiled,
}

impl Matcher {
    /// Compile `pattern` under `mode`. Only `RegExpMatch` can fail.
    pub fn new(mode: MatchingMode, pattern: &str) -> Result<Self, regex::Error> {
        let compiled = match mode {
            MatchingMode::StrictMatch => Compiled::Strict(pattern.to_string()),
            MatchingMode::WildcardMatch => Compiled::Wildcard(pattern.to_string()),
            MatchingMode::RegExpMatch => Compiled::RegExp(Regex::new(pattern)?),
        };
        Ok(Self { compiled })
    }

    pub fn mode(&self) -> MatchingMode {
        match self.compiled {
            Compiled::Strict(_) => MatchingMode::StrictMatch,
            Compiled::Wildcard(_) => MatchingMode::WildcardMatch,
            Compiled::RegExp(_) => MatchingMode::RegExpMatch,
        }
    }

    pub fn pattern(&self) -> &str {
        match &self.compiled {
            Compiled::Strict(p) | Compiled::Wildcard(p) => p,
            Compiled::RegExp(re) => re.as_str(),
        }
    }

    /// Whether `subject` matches the compiled pattern. Total; never fails.
    pub fn matches(&self, subject: &str) -> bool {
        match &self.compiled {
            Compiled::Strict(p) => subject == p,
            Compiled::Wildcard(p) => wildcard_match(subject.as_bytes(), p.as_bytes()),
            Compiled::RegExp(re) => re.is_match(subject),
        }
    }
}

/// Greedy wildcard match with single-star backtracking. `*` matches zero
/// or more bytes, `?` exactly one, everything else is literal.
fn wildcard_match(subject: &[u8], pattern: &[u8]) -> bool {
    let mut s = 0;
    let mut p = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while s < subject.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == subject[s]) {
            s += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = s;
            p += 1;
        } else if let Some(star_pos) = star {
            // Give the last `*` one more byte and retry from there.
            p = star_pos + 1;
            mark += 1;
            s = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
