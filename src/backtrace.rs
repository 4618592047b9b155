//! Backtrace capture
//!
//! The dispatcher consumes backtraces through the [`BacktraceGenerator`]
//! capability; where the frames come from is the generator's business.
//! [`SystemBacktraceGenerator`] walks the calling thread's stack with the
//! `backtrace` crate and resolves symbols; [`CannedBacktraceGenerator`]
//! returns a fixed answer for tests and for hosts built without symbol
//! data.

/// Maximum stack depth to capture (prevents runaway walks).
const MAX_STACK_DEPTH: usize = 64;

/// A single resolved stack frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Module (shared object / executable) the frame belongs to. May be
    /// empty when the platform does not expose it.
    pub module: String,
    /// Demangled function name, empty when resolution failed.
    pub function: String,
    /// Source file, empty when no debug info is available.
    pub source: String,
    /// Source line, 0 when unknown.
    pub line: u32,
}

/// An ordered sequence of frames, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Capability the dispatcher uses to acquire backtraces.
pub trait BacktraceGenerator: Send + Sync {
    /// Capture the current call stack. Frames beyond the instrumentation
    /// site itself are included.
    fn capture(&self) -> Backtrace;
}

/// Walks the calling thread's stack and resolves symbols. Symbol caching
/// is left to the underlying unwinder.
#[derive(Debug)]
pub struct SystemBacktraceGenerator {
    max_depth: usize,
}

impl SystemBacktraceGenerator {
    pub fn new() -> Self {
        Self {
            max_depth: MAX_STACK_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for SystemBacktraceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceGenerator for SystemBacktraceGenerator {
    fn capture(&self) -> Backtrace {
        let mut frames = Vec::with_capacity(16);
        ::backtrace::trace(|raw_frame| {
            let mut frame = Frame::default();
            let mut resolved = false;
            ::backtrace::resolve_frame(raw_frame, |symbol| {
                if let Some(name) = symbol.name() {
                    frame.function = name.to_string();
                }
                if let Some(filename) = symbol.filename() {
                    frame.source = filename.display().to_string();
                }
                if let Some(line) = symbol.lineno() {
                    frame.line = line;
                }
                resolved = true;
            });
            if resolved {
                frames.push(frame);
            }
            frames.len() < self.max_depth
        });
        Backtrace::new(frames)
    }
}

/// Returns a fixed backtrace on every capture.
#[derive(Debug, Clone, Default)]
pub struct CannedBacktraceGenerator {
    frames: Vec<Frame>,
}

impl CannedBacktraceGenerator {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }
}

impl BacktraceGenerator for CannedBacktraceGenerator {
    fn capture(&self) -> Backtrace {
        Backtrace::new(self.frames.clone())
    }
}
