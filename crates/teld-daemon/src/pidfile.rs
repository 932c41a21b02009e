//! PID-file interlock.
//!
//! An exclusive advisory lock on the pid file guarantees a single live
//! daemon per path. Because instrumented processes spawn the daemon
//! opportunistically, losing the lock race is the expected case and maps
//! to a silent, successful exit: another daemon is already serving.
//!
//! The watcher holds the lock for a supervised daemon; workers it spawns
//! get `--no-pidfile` so only the lock holder ever writes its pid.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

/// Error raised by [`PidFile::create`].
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    /// Another process holds the lock; a daemon is already live.
    #[error("pid file {} is locked by another process", .0.display())]
    Locked(PathBuf),

    /// The file could not be opened or locked.
    #[error("cannot open pid file {path}: {source}")]
    Io {
        /// The pid file path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// An open, exclusively locked pid file.
///
/// The lock lives as long as the file handle; dropping the `PidFile`
/// without calling [`remove`](Self::remove) releases the lock but leaves
/// the file behind, which the next daemon happily reuses.
#[derive(Debug)]
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    /// Open or create the file at `path` and take the exclusive advisory
    /// lock without blocking.
    ///
    /// # Errors
    ///
    /// [`PidFileError::Locked`] when another process holds the lock; the
    /// caller must treat that as "another daemon is live" and exit with
    /// success. [`PidFileError::Io`] for anything else.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let io_err = |source| PidFileError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(PidFileError::Locked(path))
            }
            Err(e) => Err(io_err(e)),
        }
    }

    /// The pid file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store the current process id as a decimal string, truncating any
    /// prior contents.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the write fails.
    pub fn write(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{}", std::process::id())?;
        self.file.flush()
    }

    /// Release the lock and unlink the file. Best-effort: an unlink
    /// failure is logged, not fatal.
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "cannot remove pid file: {e}");
        }
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "cannot unlock pid file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_create_sees_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teld.pid");

        let winner = PidFile::create(&path).unwrap();
        match PidFile::create(&path) {
            Err(PidFileError::Locked(p)) => assert_eq!(p, path),
            other => panic!("expected Locked, got {other:?}"),
        }

        winner.remove();
        let third = PidFile::create(&path).unwrap();
        third.remove();
    }

    #[test]
    fn test_write_stores_decimal_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teld.pid");

        let mut pidfile = PidFile::create(&path).unwrap();
        pidfile.write().unwrap();
        pidfile.write().unwrap(); // idempotent, truncates

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
        pidfile.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_creates_one_winner() {
        use std::sync::Barrier;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("teld.pid");
        let barrier = std::sync::Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    match PidFile::create(&path) {
                        Ok(pidfile) => {
                            // Hold the lock well past the loser's attempt.
                            std::thread::sleep(std::time::Duration::from_millis(200));
                            pidfile.remove();
                            true
                        }
                        Err(PidFileError::Locked(_)) => false,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("locker panicked"))
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);

        // After the winner's remove, a later create succeeds.
        PidFile::create(&path).unwrap().remove();
    }
}
