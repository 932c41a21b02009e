//! Process supervision: progenitor re-exec and the watcher respawn loop.
//!
//! The progenitor's only job is to respawn the daemon in a new session so
//! it sheds the controlling TTY and outlives whatever application process
//! spawned it. The watcher then keeps a worker alive: a crashed worker is
//! logged and respawned after a short delay, a worker that exits with a
//! code takes the watcher down with that code.

use std::io;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use teld_core::env::Environment;
use teld_core::exit;
use teld_core::role::ROLE_ENV_VAR;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Delay before respawning a crashed worker, so repeated crashes cannot
/// turn into a tight spawn loop.
pub const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Error raised while spawning a supervision-chain process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The daemon executable path could not be resolved.
    #[error("cannot resolve daemon executable: {0}")]
    Resolve(#[source] io::Error),

    /// The kernel mishandled a missing system call during spawn.
    #[error("{0}")]
    UnsupportedOs(String),

    /// The spawn itself failed.
    #[error("cannot spawn daemon process: {0}")]
    Spawn(#[source] io::Error),
}

/// Re-exec the current binary as a watcher in a new session.
///
/// The child's working directory is `/`, so the executable path must be
/// absolute before the re-exec — [`std::env::current_exe`] guarantees
/// that. The original arguments pass through unchanged; only the role
/// environment variable is added.
///
/// # Errors
///
/// Returns a [`SpawnError`]; a kernel that reports `EBADF` for a missing
/// pipe syscall maps to the unsupported-OS diagnostic.
pub fn spawn_watcher() -> Result<std::process::Child, SpawnError> {
    let exe = std::env::current_exe().map_err(SpawnError::Resolve)?;

    let mut env = Environment::capture();
    env.set(ROLE_ENV_VAR, "watcher");
    env.set("PWD", "/");

    let mut cmd = std::process::Command::new(&exe);
    cmd.args(std::env::args_os().skip(1))
        .current_dir("/")
        .env_clear();
    for (key, value) in env.iter() {
        cmd.env(key, value);
    }

    #[allow(unsafe_code)]
    unsafe {
        use std::os::unix::process::CommandExt;
        // New session: no controlling TTY, survives the original parent.
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    cmd.spawn().map_err(map_spawn_error)
}

fn spawn_worker() -> Result<tokio::process::Child, SpawnError> {
    let exe = std::env::current_exe().map_err(SpawnError::Resolve)?;

    let mut cmd = tokio::process::Command::new(&exe);
    cmd.args(std::env::args_os().skip(1));
    // The watcher holds the pid-file lock; the worker must not contend
    // for it.
    if !std::env::args().any(|arg| arg == "--no-pidfile") {
        cmd.arg("--no-pidfile");
    }
    cmd.env(ROLE_ENV_VAR, "worker");

    cmd.spawn().map_err(map_spawn_error)
}

fn map_spawn_error(e: io::Error) -> SpawnError {
    // Some very old kernels mishandle missing system calls: a missing
    // pipe2 surfaces as EBADF instead of ENOSYS. Give those hosts a
    // readable diagnostic instead of "bad file descriptor".
    if e.raw_os_error() == Some(nix::errno::Errno::EBADF as i32) {
        return SpawnError::UnsupportedOs(borked_syscall_message("pipe2"));
    }
    SpawnError::Spawn(e)
}

fn borked_syscall_message(syscall: &str) -> String {
    let version = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map_or_else(|_| "unknown".to_string(), |v| v.trim().to_string());
    format!(
        "this operating system is not supported by the daemon: \
         {syscall} is missing, but did not return -ENOSYS (kernel {version})"
    )
}

/// Run the watcher role: keep exactly one worker alive.
///
/// A terminating signal is forwarded to the worker; once the worker is
/// reaped the watcher exits. A worker killed by anything else is
/// respawned after [`RESPAWN_DELAY`].
pub async fn run_watcher() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(t), Ok(i)) => (t, i),
        (Err(e), _) | (_, Err(e)) => {
            error!("cannot install signal handlers: {e}");
            exit::set(1);
            return;
        }
    };

    loop {
        let mut worker = match spawn_worker() {
            Ok(child) => child,
            Err(e) => {
                error!("unable to spawn worker process: {e}");
                exit::set(1);
                return;
            }
        };
        info!(pid = worker.id(), "worker started");

        let mut terminating = false;
        let status = loop {
            tokio::select! {
                status = worker.wait() => match status {
                    Ok(status) => break status,
                    Err(e) => {
                        error!("cannot wait for worker: {e}");
                        exit::set(1);
                        return;
                    }
                },
                _ = sigterm.recv() => {
                    terminating = true;
                    forward(&worker, Signal::SIGTERM);
                }
                _ = sigint.recv() => {
                    terminating = true;
                    forward(&worker, Signal::SIGINT);
                }
            }
        };

        match status.code() {
            Some(code) => {
                // Graceful termination: the watcher follows the worker.
                if code == 0 {
                    info!("worker exited cleanly");
                } else {
                    warn!(code, "worker exited");
                }
                exit::set(code);
                return;
            }
            None if terminating => {
                info!("worker reaped after forwarded signal");
                return;
            }
            None => {
                warn!(status = %status, "worker crashed, respawning");
                tokio::time::sleep(RESPAWN_DELAY).await;
            }
        }
    }
}

fn forward(worker: &tokio::process::Child, sig: Signal) {
    let Some(pid) = worker.id() else { return };
    #[allow(clippy::cast_possible_wrap)]
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, "cannot forward {sig} to worker: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ebadf_maps_to_unsupported_os() {
        let err = map_spawn_error(io::Error::from_raw_os_error(
            nix::errno::Errno::EBADF as i32,
        ));
        match err {
            SpawnError::UnsupportedOs(msg) => {
                assert!(msg.contains("pipe2"));
                assert!(msg.contains("not supported"));
            }
            other => panic!("expected UnsupportedOs, got {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_stay_spawn_errors() {
        let err = map_spawn_error(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, SpawnError::Spawn(_)));
    }
}
