//! Daemon log initialisation and rotation.
//!
//! The log writer can be reopened while the daemon runs: the worker's
//! SIGHUP handler calls [`LogHandle::reopen`] so external log rotation
//! works without a restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use teld_core::config::LogLevel;
use teld_core::Config;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Locations tried when `--logfile` is not set, in order.
pub const STANDARD_LOG_LOCATIONS: [&str; 2] = [
    "/var/log/newrelic/newrelic-daemon.log",
    "/var/log/newrelic-daemon.log",
];

/// Error raised during log initialisation.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The configured log file could not be opened.
    #[error("cannot open log file {path}: {source}")]
    Unwritable {
        /// Offending path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// None of the standard locations were writable.
    #[error(
        "unable to find a suitable log file location, \
         please check that {0} exists and is writable"
    )]
    NoLocation(String),
}

#[derive(Debug)]
struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

/// A cloneable handle to the daemon log file.
#[derive(Debug, Clone)]
pub struct LogHandle {
    inner: Arc<ReopenableFile>,
}

impl LogHandle {
    /// Open (or create, appending) the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Unwritable`] when the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Unwritable {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            inner: Arc::new(ReopenableFile {
                path,
                file: Mutex::new(file),
            }),
        })
    }

    /// Reopen the log file at its original path, picking up a rotation.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the previous file stays in use.
    pub fn reopen(&self) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        *self
            .inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = file;
        Ok(())
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// Writer vended to the tracing subscriber; each write locks the shared
/// file so a reopen never tears a line.
#[derive(Debug)]
pub struct LogWriter {
    inner: Arc<ReopenableFile>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

const fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warning => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
    }
}

/// Open the daemon log and install the global subscriber.
///
/// With `--logfile` unset the standard locations are tried in order; if
/// none is writable the error names the first so the operator knows what
/// to create.
///
/// # Errors
///
/// Returns a [`LogError`] when no log file can be opened.
pub fn init(cfg: &Config) -> Result<LogHandle, LogError> {
    let handle = open_target(cfg)?;

    tracing_subscriber::fmt()
        .with_max_level(level_filter(cfg.loglevel))
        .with_writer(handle.clone())
        .with_ansi(false)
        .init();

    Ok(handle)
}

fn open_target(cfg: &Config) -> Result<LogHandle, LogError> {
    if !cfg.logfile.is_empty() {
        return LogHandle::open(&cfg.logfile);
    }
    for location in STANDARD_LOG_LOCATIONS {
        if let Ok(handle) = LogHandle::open(location) {
            return Ok(handle);
        }
    }
    Err(LogError::NoLocation(
        STANDARD_LOG_LOCATIONS[0].to_string(),
    ))
}
