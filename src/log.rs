//! Diagnostic logging for the tracer itself
//!
//! The framework reports its own status and failures through the [`Log`]
//! trait so a host can redirect or silence them. Nothing here ever reaches
//! the trace output; these are diagnostics about the tracer, not trace
//! entries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sink for the tracer's own diagnostics.
pub trait Log: Send + Sync {
    /// Report a failure inside the tracer (load error, dropped entry).
    fn write_error(&self, message: &str);

    /// Report a status line (configuration found, output selected).
    fn write_status(&self, message: &str);
}

/// Routes diagnostics to the `tracing` crate under the `spoor` target.
#[derive(Debug, Default)]
pub struct TracingLog;

impl Log for TracingLog {
    fn write_error(&self, message: &str) {
        tracing::warn!(target: "spoor", "{}", message);
    }

    fn write_status(&self, message: &str) {
        tracing::info!(target: "spoor", "{}", message);
    }
}

/// Discards all diagnostics.
#[derive(Debug, Default)]
pub struct NullLog;

impl Log for NullLog {
    fn write_error(&self, _message: &str) {}

    fn write_status(&self, _message: &str) {}
}

/// Collects diagnostics in memory. Intended for tests and for hosts that
/// surface tracer diagnostics through their own channels.
#[derive(Debug, Default)]
pub struct MemoryLog {
    errors: Mutex<Vec<String>>,
    statuses: Mutex<Vec<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All error lines reported so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All status lines reported so far.
    pub fn statuses(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Log for MemoryLog {
    fn write_error(&self, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }

    fn write_status(&self, message: &str) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

/// Categories used to rate-limit repeated output failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Establishing a connection to a remote collector failed.
    Connect,
    /// Writing serialized bytes to the sink failed.
    Write,
    /// Opening the trace file failed.
    FileOpen,
}

/// Suppresses repeated reports of the same error category inside a fixed
/// window, so a dead sink cannot flood the diagnostic log on every visit.
#[derive(Debug)]
pub struct ErrorThrottle {
    window: Duration,
    last_report: Mutex<HashMap<ErrorCategory, Instant>>,
}

impl ErrorThrottle {
    /// Window used by the dispatcher: one report per category per minute.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_report: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an error of `category` should be reported now. Recording
    /// happens as a side effect: a `true` answer starts a new window.
    pub fn should_report(&self, category: ErrorCategory) -> bool {
        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(&category) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(category, now);
                true
            }
        }
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
