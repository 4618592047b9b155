//! Trace entries
//!
//! A [`TraceEntry`] is the ephemeral record produced for one accepted visit
//! to a trace point. It owns everything captured for that visit: the
//! optional message copy, the variable snapshot, and the backtrace. The
//! entry lives exactly as long as one trip through the serializer and the
//! output.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::backtrace::Backtrace;
use crate::point::TracePoint;

/// A captured variable: name plus stringified value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    name: String,
    value: String,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// The variables captured at one watch site. Built by the instrumentation
/// layer on the stack and moved into the entry only on acceptance, so the
/// dropped path costs nothing beyond the stringification itself.
pub type VariableSnapshot = Vec<Variable>;

/// One record per accepted visit.
#[derive(Debug)]
pub struct TraceEntry<'a> {
    timestamp: u64,
    point: &'a TracePoint,
    message: Option<String>,
    variables: Option<VariableSnapshot>,
    backtrace: Option<Backtrace>,
}

impl<'a> TraceEntry<'a> {
    /// Construct an entry stamped with the current wall clock.
    pub fn new(point: &'a TracePoint, message: Option<&str>) -> Self {
        Self::with_timestamp(point, message, now_seconds())
    }

    /// Construct an entry with an explicit timestamp. Serialization tests
    /// and replay tooling need deterministic clocks.
    pub fn with_timestamp(point: &'a TracePoint, message: Option<&str>, timestamp: u64) -> Self {
        Self {
            timestamp,
            point,
            message: message.map(str::to_string),
            variables: None,
            backtrace: None,
        }
    }

    /// Take exclusive ownership of the captured variables.
    pub fn attach_variables(&mut self, variables: VariableSnapshot) {
        self.variables = Some(variables);
    }

    /// Take exclusive ownership of a captured backtrace.
    pub fn attach_backtrace(&mut self, backtrace: Backtrace) {
        self.backtrace = Some(backtrace);
    }

    /// Wall clock seconds at construction.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn point(&self) -> &TracePoint {
        self.point
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn variables(&self) -> Option<&[Variable]> {
        self.variables.as_deref()
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
