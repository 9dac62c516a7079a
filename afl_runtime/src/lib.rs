/*!
Target-side runtime for AFL-style fuzzing.

This crate is linked into the *fuzzed* process. It attaches to the coverage
map the fuzzer created, turns code-site identifiers into shared-memory
counter updates, and speaks the forkserver handshake over the two well-known
file descriptors, so a supervisor like `afl-fuzz` can drive many executions
out of one pre-warmed process.

The pieces are:
- [`shmem::AflShMem`]: attach to the supervisor-owned coverage segment.
- [`coverage`]: the bit-exact edge hash and the [`coverage::CoverageRecorder`].
- [`forkserver::ForkserverChannel`]: the fixed-framing forkserver protocol.
- [`runtime::AflRuntime`]: the per-process instrumentation context that the
  host harness owns and threads through every call.
- [`os`]: abrupt termination and crash signaling.

Everything here assumes a single logical thread per target process. Forked
children inherit the same mapping and race on it; that is accepted coverage
noise, not a bug.
*/

#![cfg(unix)]

use core::fmt::{self, Display};
use std::{env::VarError, io, num::ParseIntError, sync::Mutex};

use log::{Metadata, Record};

pub mod coverage;
pub mod forkserver;
pub mod os;
pub mod runtime;
pub mod shmem;

pub use coverage::{location_hash, CoverageRecorder};
pub use forkserver::ForkserverChannel;
pub use runtime::AflRuntime;
pub use shmem::AflShMem;

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`backtrace::Backtrace`])
pub type ErrorBacktrace = backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// Empty struct to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace {}
#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[allow(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `afl_runtime`
#[derive(Debug)]
pub enum Error {
    /// Required environment configuration is missing or unparsable
    Config(String, ErrorBacktrace),
    /// You're holding it wrong: operation invoked out of lifecycle order
    IllegalState(String, ErrorBacktrace),
    /// The OS refused a resource, most likely the shared mapping
    OsError(io::Error, String, ErrorBacktrace),
    /// A wire frame was not transferred completely
    Protocol(String, ErrorBacktrace),
}

impl Error {
    /// Required environment configuration is missing or unparsable
    #[must_use]
    pub fn config<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Config(arg.into(), ErrorBacktrace::new())
    }

    /// Operation invoked out of lifecycle order
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::new())
    }

    /// OS resource failure with a given [`io::Error`]
    #[must_use]
    pub fn os_error<S>(err: io::Error, msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(err, msg.into(), ErrorBacktrace::new())
    }

    /// OS resource failure, taking the error code from `errno`
    #[must_use]
    pub fn last_os_error<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(io::Error::last_os_error(), msg.into(), ErrorBacktrace::new())
    }

    /// A wire frame was not transferred completely
    #[must_use]
    pub fn protocol<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Protocol(arg.into(), ErrorBacktrace::new())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(s, b) => {
                write!(f, "Invalid configuration: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::OsError(err, s, b) => {
                write!(f, "OS error: {0}: {1:?}", &s, &err)?;
                display_error_backtrace(f, b)
            }
            Self::Protocol(s, b) => {
                write!(f, "Forkserver protocol violation: {0}", &s)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<VarError> for Error {
    fn from(err: VarError) -> Self {
        Self::config(format!("Environment variable not usable: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::config(format!("Failed to parse Int: {err:?}"))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::os_error(err, "io::Error occurred")
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::os_error(io::Error::from_raw_os_error(err as i32), "Unix error")
    }
}

/// File logger, registered with [`log::set_logger`]
pub static AFL_RUNTIME_FILE_LOGGER: FileLogger = FileLogger::new();

/// A [`log::Log`] implementation appending to a file.
///
/// The supervisor swallows the target's stdio, so diagnostics go to a file
/// the user can `tail -f` instead. [`crate::os::terminate`] flushes the
/// registered logger before the process is torn down.
#[derive(Debug)]
pub struct FileLogger {
    file: Mutex<Option<std::fs::File>>,
}

impl FileLogger {
    /// Create a new, not yet registered, [`FileLogger`]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Register the file logger, truncating `path` if it exists
    pub fn set_logger(path: &str) -> Result<(), Error> {
        let file = std::fs::File::create(path)
            .map_err(|err| Error::os_error(err, format!("Failed to open log file {path}")))?;
        *AFL_RUNTIME_FILE_LOGGER.file.lock().unwrap() = Some(file);
        log::set_logger(&AFL_RUNTIME_FILE_LOGGER)
            .map_err(|_| Error::illegal_state("Failed to register logger"))?;
        log::set_max_level(log::LevelFilter::Trace);
        Ok(())
    }
}

impl Default for FileLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for FileLogger {
    #[inline]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        use std::io::Write;
        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = writeln!(file, "{}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        use std::io::Write;
        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("short read on fd 198");
        assert!(format!("{err}").contains("short read on fd 198"));
        let err = Error::config("__AFL_SHM_ID not set");
        assert!(format!("{err}").starts_with("Invalid configuration"));
    }
}
