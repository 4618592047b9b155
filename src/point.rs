//! Trace points
//!
//! A [`TracePoint`] is a statically declared instrumentation site: fixed
//! location, kind, and verbosity, plus a small decision cache that the
//! dispatcher keeps consistent with the active configuration. The
//! instrumentation layer declares one `static` per call site; the cache
//! words are atomics so they stay writable through a shared reference.
//!
//! Cache protocol: when `cached_generation()` equals the dispatcher's
//! current configuration token, the three decision bits are authoritative
//! and the visit path skips the filter trees entirely. The bits are
//! rewritten only under the dispatcher's state lock; the token is stored
//! last with release ordering so a reader that observes the new token also
//! observes the new bits. A stale token read merely causes one redundant,
//! idempotent reconsideration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Token value meaning "never evaluated under any configuration".
pub const UNCONFIGURED: u64 = 0;

/// The kind of event a trace point reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracePointKind {
    Error,
    Debug,
    Log,
    Watch,
}

impl TracePointKind {
    pub fn name(&self) -> &'static str {
        match self {
            TracePointKind::Error => "error",
            TracePointKind::Debug => "debug",
            TracePointKind::Log => "log",
            TracePointKind::Watch => "watch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(TracePointKind::Error),
            "debug" => Some(TracePointKind::Debug),
            "log" => Some(TracePointKind::Log),
            "watch" => Some(TracePointKind::Watch),
            _ => None,
        }
    }
}

/// A statically declared instrumentation site.
#[derive(Debug)]
pub struct TracePoint {
    kind: TracePointKind,
    verbosity: u16,
    source_file: &'static str,
    line: u32,
    function: &'static str,
    keys: &'static [&'static str],

    // Decision cache, kept adjacent for locality.
    last_used_config: AtomicU64,
    active: AtomicBool,
    backtraces_enabled: AtomicBool,
    variables_enabled: AtomicBool,
}

impl TracePoint {
    /// Declare a trace point without trace keys. `const` so call sites can
    /// place the point in a `static`.
    pub const fn new(
        kind: TracePointKind,
        verbosity: u16,
        source_file: &'static str,
        line: u32,
        function: &'static str,
    ) -> Self {
        Self::with_keys(kind, verbosity, source_file, line, function, &[])
    }

    /// Declare a trace point carrying trace-key membership supplied by the
    /// instrumentation layer.
    pub const fn with_keys(
        kind: TracePointKind,
        verbosity: u16,
        source_file: &'static str,
        line: u32,
        function: &'static str,
        keys: &'static [&'static str],
    ) -> Self {
        Self {
            kind,
            verbosity,
            source_file,
            line,
            function,
            keys,
            last_used_config: AtomicU64::new(UNCONFIGURED),
            active: AtomicBool::new(false),
            backtraces_enabled: AtomicBool::new(false),
            variables_enabled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TracePointKind {
        self.kind
    }

    pub fn verbosity(&self) -> u16 {
        self.verbosity
    }

    pub fn source_file(&self) -> &'static str {
        self.source_file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn keys(&self) -> &'static [&'static str] {
        self.keys
    }

    /// The configuration token the decision bits were computed under.
    pub fn cached_generation(&self) -> u64 {
        self.last_used_config.load(Ordering::Acquire)
    }

    /// Whether the last reconsideration decided this point is traced.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Whether accepted visits should capture a backtrace.
    pub fn backtraces_enabled(&self) -> bool {
        self.backtraces_enabled.load(Ordering::Relaxed)
    }

    /// Whether accepted visits should keep their variable snapshot.
    pub fn variables_enabled(&self) -> bool {
        self.variables_enabled.load(Ordering::Relaxed)
    }

    /// Rewrite the decision cache. Called by the dispatcher under its state
    /// lock; the token is stored last so the bits are visible first.
    pub(crate) fn store_decision(
        &self,
        generation: u64,
        active: bool,
        backtraces: bool,
        variables: bool,
    ) {
        self.active.store(active, Ordering::Relaxed);
        self.backtraces_enabled.store(backtraces, Ordering::Relaxed);
        self.variables_enabled.store(variables, Ordering::Relaxed);
        self.last_used_config.store(generation, Ordering::Release);
    }
}
