//! Trace outputs
//!
//! An [`Output`] consumes the serializer's byte sequences. The set of
//! sinks the loader can produce is closed, so this is a tagged enum:
//! standard output, a trace file, or a TCP connection to a remote
//! collector. The dispatcher serializes all writes through its state lock,
//! so outputs themselves are single-threaded.
//!
//! Failures never reach the host's trace sites; the dispatcher logs them
//! (rate-limited) and drops the entry.

use std::fs::File;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::log::ErrorCategory;
use crate::platform;

/// Default collector port, compiled in.
pub const DEFAULT_PORT: u16 = 12382;

/// Default deadline for TCP connects and writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Reconnection attempts granted after a connection is lost.
const RECONNECT_BUDGET: u32 = 3;

/// A failure to deliver serialized bytes.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("write failed: {source}")]
    Write { source: io::Error },

    #[error("cannot open trace file {path}: {source}")]
    FileOpen { path: PathBuf, source: io::Error },
}

impl OutputError {
    /// Rate-limiting category for the diagnostic log.
    pub fn category(&self) -> ErrorCategory {
        match self {
            OutputError::Connect { .. } => ErrorCategory::Connect,
            OutputError::Write { .. } => ErrorCategory::Write,
            OutputError::FileOpen { .. } => ErrorCategory::FileOpen,
        }
    }
}

/// A sink for serialized trace entries.
#[derive(Debug)]
pub enum Output {
    Stdout(StdoutOutput),
    File(FileOutput),
    Tcp(TcpOutput),
}

impl Output {
    /// Advisory: whether a write can currently be expected to succeed.
    /// Checked before serialization to skip the work for dead sinks.
    pub fn can_write(&self) -> bool {
        match self {
            Output::Stdout(_) => true,
            Output::File(output) => output.can_write(),
            Output::Tcp(output) => output.can_write(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        match self {
            Output::Stdout(output) => output.write(bytes),
            Output::File(output) => output.write(bytes),
            Output::Tcp(output) => output.write(bytes),
        }
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        match self {
            Output::Stdout(output) => output.flush(),
            Output::File(output) => output.flush(),
            Output::Tcp(output) => output.flush(),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Output::Stdout(StdoutOutput)
    }
}

/// Writes to the process's standard output. Always writable.
#[derive(Debug, Default)]
pub struct StdoutOutput;

impl StdoutOutput {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        io::stdout()
            .write_all(bytes)
            .map_err(|source| OutputError::Write { source })
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        io::stdout()
            .flush()
            .map_err(|source| OutputError::Write { source })
    }
}

/// Writes to a trace file. Filename options are resolved when the file is
/// first opened, not when the output is configured.
#[derive(Debug)]
pub struct FileOutput {
    filename: String,
    overwrite_existing: bool,
    relative_to_user_home: bool,
    file: Option<(File, PathBuf)>,
}

impl FileOutput {
    pub fn new(filename: &str, overwrite_existing: bool, relative_to_user_home: bool) -> Self {
        Self {
            filename: filename.to_string(),
            overwrite_existing,
            relative_to_user_home,
            file: None,
        }
    }

    fn can_write(&self) -> bool {
        // Open failures are retried on the next write.
        true
    }

    /// The path of the open trace file, once the first write resolved it.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(_, path)| path.as_path())
    }

    fn open(&mut self) -> Result<(), OutputError> {
        let path = resolve_trace_file_path(
            &self.filename,
            self.overwrite_existing,
            self.relative_to_user_home,
            &platform::user_home(),
        );
        let file = File::create(&path).map_err(|source| OutputError::FileOpen {
            path: path.clone(),
            source,
        })?;
        self.file = Some((file, path));
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        if self.file.is_none() {
            self.open()?;
        }
        match self.file.as_mut() {
            Some((file, _)) => file
                .write_all(bytes)
                .map_err(|source| OutputError::Write { source }),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        match self.file.as_mut() {
            Some((file, _)) => file
                .flush()
                .map_err(|source| OutputError::Write { source }),
            None => Ok(()),
        }
    }
}

/// Resolve the effective trace file path from the configured options.
/// Relative paths are prefixed with the user's home when requested; when
/// overwriting is disabled, `_N` is appended before the extension until an
/// unused name is found. Not atomic against concurrent creators.
fn resolve_trace_file_path(
    filename: &str,
    overwrite_existing: bool,
    relative_to_user_home: bool,
    home: &Path,
) -> PathBuf {
    let mut path = PathBuf::from(filename);
    if relative_to_user_home && !path.is_absolute() {
        path = home.join(path);
    }
    if overwrite_existing || !path.exists() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for n in 1u32.. {
        let name = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("u32 filename counter exhausted")
}

/// Writes to a remote collector over TCP. The connection is established
/// lazily on the first write and re-established after failures until the
/// retry budget is spent; a successful connect refills the budget.
#[derive(Debug)]
pub struct TcpOutput {
    host: String,
    port: u16,
    write_timeout: Duration,
    stream: Option<TcpStream>,
    reconnect_budget: u32,
}

impl TcpOutput {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            stream: None,
            reconnect_budget: RECONNECT_BUDGET,
        }
    }

    /// Deadline applied to connects and writes so a stalled collector
    /// cannot stall the host.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn can_write(&self) -> bool {
        self.stream.is_some() || self.reconnect_budget > 0
    }

    fn connect(&self) -> Result<TcpStream, OutputError> {
        let connect_error = |source: io::Error| OutputError::Connect {
            host: self.host.clone(),
            port: self.port,
            source,
        };

        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(connect_error)?
            .collect();

        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.write_timeout) {
                Ok(stream) => {
                    stream
                        .set_write_timeout(Some(self.write_timeout))
                        .map_err(connect_error)?;
                    return Ok(stream);
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(connect_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        })))
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                if self.reconnect_budget == 0 {
                    return Err(OutputError::Connect {
                        host: self.host.clone(),
                        port: self.port,
                        source: io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            "reconnection budget exhausted",
                        ),
                    });
                }
                match self.connect() {
                    Ok(stream) => {
                        self.reconnect_budget = RECONNECT_BUDGET;
                        stream
                    }
                    Err(err) => {
                        self.reconnect_budget -= 1;
                        return Err(err);
                    }
                }
            }
        };

        match stream.write_all(bytes) {
            Ok(()) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(source) => {
                // Drop the broken connection; the next write reconnects.
                self.reconnect_budget = self.reconnect_budget.saturating_sub(1);
                Err(OutputError::Write { source })
            }
        }
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        match self.stream.as_mut() {
            Some(stream) => stream
                .flush()
                .map_err(|source| OutputError::Write { source }),
            None => Ok(()),
        }
    }
}
