//! The trace dispatcher
//!
//! A [`Trace`] is the object reachable from every instrumentation site. It
//! owns the active configuration (filter trees, serializer, output) and
//! implements the visit protocol:
//!
//! 1. Compare the point's cached configuration token with the current one;
//!    reconsider the point if they differ.
//! 2. Inactive points return immediately, dropping any captured variables.
//! 3. Active visits build a [`TraceEntry`], attach a backtrace and the
//!    variable snapshot when the decision bits ask for them, serialize,
//!    and hand the bytes to the output.
//!
//! Visits may come from arbitrary threads. One mutex guards the mutable
//! state; the configuration token is an atomic read on the fast path.
//! Because serialization and the write happen under that lock, entries
//! from one thread appear in program order and each record is written
//! atomically with respect to other threads.
//!
//! No failure here ever propagates to the host: output errors are logged
//! (rate-limited per category) and the entry is dropped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backtrace::{BacktraceGenerator, SystemBacktraceGenerator};
use crate::config::{Actions, Configuration, StorageConfig, TracePointSet};
use crate::entry::{TraceEntry, VariableSnapshot};
use crate::filter::TraceKeySet;
use crate::log::{ErrorThrottle, Log, TracingLog};
use crate::output::Output;
use crate::point::TracePoint;
use crate::serializer::Serializer;

// Configuration tokens are drawn from a process-wide counter so a token
// can never repeat across configuration or dispatcher replacement.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

struct TraceState {
    serializer: Serializer,
    output: Output,
    sets: Vec<TracePointSet>,
    keys: TraceKeySet,
    storage: Option<StorageConfig>,
}

impl TraceState {
    fn from_configuration(configuration: Configuration) -> Self {
        let keys = configuration.key_set();
        Self {
            serializer: configuration.serializer,
            output: configuration.output,
            sets: configuration.trace_point_sets,
            keys,
            storage: configuration.storage,
        }
    }
}

/// The dispatcher owning serializer, output, filter trees, and the
/// backtrace generator.
pub struct Trace {
    state: Mutex<TraceState>,
    generation: AtomicU64,
    shut_down: AtomicBool,
    log: Arc<dyn Log>,
    throttle: ErrorThrottle,
    backtrace_generator: Box<dyn BacktraceGenerator>,
}

impl Trace {
    /// A dispatcher with an empty configuration: every trace point is
    /// inactive until [`Trace::configure`] installs one.
    pub fn new() -> Self {
        Self::with_log(Arc::new(TracingLog))
    }

    pub fn with_log(log: Arc<dyn Log>) -> Self {
        Self {
            state: Mutex::new(TraceState::from_configuration(Configuration::empty())),
            generation: AtomicU64::new(next_generation()),
            shut_down: AtomicBool::new(false),
            log,
            throttle: ErrorThrottle::default(),
            backtrace_generator: Box::new(SystemBacktraceGenerator::new()),
        }
    }

    /// Replace the backtrace generator. Intended for hosts with their own
    /// unwinder and for tests.
    pub fn with_backtrace_generator(mut self, generator: Box<dyn BacktraceGenerator>) -> Self {
        self.backtrace_generator = generator;
        self
    }

    /// Install `configuration`, rotating the configuration token. Points
    /// evaluated under the previous configuration notice the stale token
    /// on their next visit and reconsider themselves; nothing is notified
    /// eagerly.
    pub fn configure(&self, configuration: Configuration) {
        let mut state = self.lock_state();
        if let Err(err) = state.output.flush() {
            self.report_output_error(&err);
        }
        *state = TraceState::from_configuration(configuration);
        self.generation.store(next_generation(), Ordering::Release);
    }

    /// Reload the configuration from `path`. Returns whether a usable
    /// configuration was installed; on any failure the dispatcher keeps
    /// running with every trace point inactive. Details go to the log.
    pub fn reload_configuration(&self, path: &Path) -> bool {
        match Configuration::from_file(path, self.log.as_ref()) {
            Ok(Some(configuration)) => {
                self.configure(configuration);
                true
            }
            Ok(None) => {
                self.configure(Configuration::empty());
                false
            }
            Err(_) => {
                // Already logged by the loader with element context.
                self.configure(Configuration::empty());
                false
            }
        }
    }

    /// The current configuration token.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Retention parameters of the active configuration, for the host's
    /// retention scheduler.
    pub fn storage_config(&self) -> Option<StorageConfig> {
        self.lock_state().storage.clone()
    }

    /// Recompute the point's decision bits against the current
    /// configuration. Idempotent; safe to call redundantly.
    pub fn reconsider(&self, point: &TracePoint) {
        let state = self.lock_state();
        let generation = self.generation.load(Ordering::Acquire);
        let mut actions = Actions::IGNORE;
        for set in &state.sets {
            actions = actions | set.consider(point, &state.keys);
        }
        point.store_decision(
            generation,
            actions.contains(Actions::LOG_TRACE_POINT),
            actions.contains(Actions::YIELD_BACKTRACE),
            actions.contains(Actions::YIELD_VARIABLES),
        );
    }

    /// Visit a trace point. The message is borrowed and copied only on
    /// acceptance; the variable snapshot is consumed either way.
    pub fn visit(
        &self,
        point: &TracePoint,
        message: Option<&str>,
        variables: Option<VariableSnapshot>,
    ) {
        debug_assert!(
            !point.source_file().is_empty(),
            "trace point without a source location"
        );
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        if point.cached_generation() != self.generation.load(Ordering::Acquire) {
            self.reconsider(point);
        }
        if !point.is_active() {
            return;
        }

        let mut entry = TraceEntry::new(point, message);
        if point.backtraces_enabled() {
            entry.attach_backtrace(self.backtrace_generator.capture());
        }
        if point.variables_enabled() {
            if let Some(snapshot) = variables {
                entry.attach_variables(snapshot);
            }
        }

        let mut state = self.lock_state();
        if !state.output.can_write() {
            return;
        }
        let bytes = state.serializer.serialize(&entry);
        if let Err(err) = state.output.write(&bytes) {
            self.report_output_error(&err);
        }
    }

    /// Drain and close. Later visits are no-ops; in-flight visits finish
    /// normally.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut state = self.lock_state();
        if let Err(err) = state.output.flush() {
            self.report_output_error(&err);
        }
    }

    fn report_output_error(&self, err: &crate::output::OutputError) {
        if self.throttle.should_report(err.category()) {
            self.log.write_error(&format!("trace output error: {}", err));
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TraceState> {
        // A panic on another thread must not disable tracing for the rest
        // of the process; the state itself stays structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

static ACTIVE_TRACE: Mutex<Option<Arc<Trace>>> = Mutex::new(None);

fn active_trace_slot() -> MutexGuard<'static, Option<Arc<Trace>>> {
    ACTIVE_TRACE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the process-wide dispatcher. Instrumentation should obtain the
/// handle once via [`active_trace`] rather than re-resolving it per visit.
pub fn install(trace: Arc<Trace>) {
    *active_trace_slot() = Some(trace);
}

/// The currently installed dispatcher, if any.
pub fn active_trace() -> Option<Arc<Trace>> {
    active_trace_slot().clone()
}

/// Remove the installed dispatcher, draining its output. Returns the
/// handle so the host can keep using it explicitly.
pub fn teardown() -> Option<Arc<Trace>> {
    let trace = active_trace_slot().take();
    if let Some(trace) = &trace {
        trace.shutdown();
    }
    trace
}
