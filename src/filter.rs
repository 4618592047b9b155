//! Filter trees
//!
//! A [`Filter`] is a recursively composable predicate over trace points.
//! The set of shapes is closed (the loader can only produce these five),
//! so the tree is a tagged enum with a single evaluation function rather
//! than an open trait hierarchy.
//!
//! Evaluation is pure: it depends only on the point's immutable fields and
//! the configured key set, and short-circuits the way boolean operators do.

use std::collections::HashSet;

use crate::matcher::Matcher;
use crate::point::TracePoint;

/// Whitelist accepts when at least one named key is present on the point;
/// blacklist accepts when none is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKeyMode {
    Whitelist,
    Blacklist,
}

impl TraceKeyMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "whitelist" => Some(TraceKeyMode::Whitelist),
            "blacklist" => Some(TraceKeyMode::Blacklist),
            _ => None,
        }
    }
}

/// View of the configured trace keys consulted during evaluation.
///
/// Only explicitly disabled keys are tracked; any key a trace point carries
/// that the configuration does not disable counts as enabled.
#[derive(Debug, Clone, Default)]
pub struct TraceKeySet {
    disabled: HashSet<String>,
}

impl TraceKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove `name` from every point's effective key set.
    pub fn disable(&mut self, name: &str) {
        self.disabled.insert(name.to_string());
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.contains(name)
    }
}

/// A composable predicate over trace points.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Disjunction. Empty `MatchAny` rejects everything.
    MatchAny(Vec<Filter>),
    /// Conjunction. Empty `MatchAll` accepts everything.
    MatchAll(Vec<Filter>),
    /// Matches against the point's source file path.
    Path(Matcher),
    /// Matches against the point's function signature.
    Function(Matcher),
    /// Set membership over the point's effective trace keys.
    TraceKeys {
        mode: TraceKeyMode,
        names: Vec<String>,
    },
}

impl Filter {
    /// Whether this filter accepts `point` given the configured `keys`.
    pub fn accepts(&self, point: &TracePoint, keys: &TraceKeySet) -> bool {
        match self {
            Filter::MatchAny(children) => children.iter().any(|f| f.accepts(point, keys)),
            Filter::MatchAll(children) => children.iter().all(|f| f.accepts(point, keys)),
            Filter::Path(matcher) => matcher.matches(point.source_file()),
            Filter::Function(matcher) => matcher.matches(point.function()),
            Filter::TraceKeys { mode, names } => {
                let hit = names.iter().any(|name| {
                    keys.is_enabled(name) && point.keys().iter().any(|key| key == name)
                });
                match mode {
                    TraceKeyMode::Whitelist => hit,
                    TraceKeyMode::Blacklist => !hit,
                }
            }
        }
    }
}
