//! teld — telemetry relay daemon.
//!
//! The binary decides what kind of process it is and hands off:
//!
//! - the **progenitor** (the default) re-execs itself as a watcher in a
//!   new session and exits, so a daemon spawned from an application
//!   process detaches cleanly;
//! - the **watcher** supervises a worker and respawns it on crash;
//! - the **worker** holds the listener and does the actual work.
//!
//! `main` stays synchronous: role dispatch, the pid-file interlock, and
//! the re-exec all happen before any async runtime exists. Only the
//! watcher and worker construct a runtime.

use teld_core::config::Config;
use teld_core::role::Role;
use teld_core::{exit, version};
use teld_daemon::pidfile::{PidFile, PidFileError};
use teld_daemon::{cli, log, supervise, utilization, worker};
use tracing::{debug, error, info};

fn main() {
    let invocation = match cli::configure() {
        Ok(invocation) => invocation,
        Err(term) => {
            eprintln!("{}", term.message);
            std::process::exit(term.code);
        }
    };
    let cfg = invocation.cfg;

    if invocation.print_version {
        println!("teld version {}", version::full());
        return;
    }

    if invocation.print_utilization {
        match serde_json::to_string_pretty(&utilization::gather(&cfg.utilization)) {
            Ok(facts) => println!("{facts}"),
            Err(e) => {
                eprintln!("error gathering utilization: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let log_handle = match log::init(&cfg) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!("{}", banner(&cfg));
    for (i, arg) in std::env::args().enumerate() {
        debug!("ARGV[{i}]: {arg}");
    }
    debug!("process role is {}", cfg.role);

    run(&cfg, &log_handle);
    std::process::exit(exit::get());
}

/// Dispatch on role. Lives apart from `main` so the pid file is removed
/// before the process exits, whatever the role did.
fn run(cfg: &Config, log_handle: &log::LogHandle) {
    let pidfile = if should_create_pidfile(cfg) {
        match PidFile::create(&cfg.pidfile) {
            Ok(mut pidfile) => {
                debug!("pidfile={}", pidfile.path().display());
                if let Err(e) = pidfile.write() {
                    error!("could not write pid to file: {e}");
                    exit::set(1);
                    return;
                }
                Some(pidfile)
            }
            Err(PidFileError::Locked(_)) => {
                // Another daemon already holds the lock. That is the
                // expected outcome of opportunistic spawning: exit quietly
                // and successfully.
                return;
            }
            Err(e) => {
                error!("could not create pid file: {e}");
                exit::set(1);
                return;
            }
        }
    } else {
        None
    };

    match cfg.role {
        Role::Progenitor => {
            if let Err(e) = supervise::spawn_watcher() {
                error!("unable to create watcher process: {e}");
                exit::set(1);
            }
        }
        Role::Watcher => match build_runtime() {
            Ok(runtime) => runtime.block_on(supervise::run_watcher()),
            Err(e) => {
                error!("cannot create runtime: {e}");
                exit::set(1);
            }
        },
        Role::Worker => match build_runtime() {
            Ok(runtime) => {
                if let Err(e) = runtime.block_on(worker::run(cfg, Some(log_handle.clone()))) {
                    error!("worker failed: {e:#}");
                    exit::set(1);
                }
            }
            Err(e) => {
                error!("cannot create runtime: {e}");
                exit::set(1);
            }
        },
    }

    if let Some(pidfile) = pidfile {
        pidfile.remove();
    }
}

/// The pid file belongs to the supervision chain, never to the
/// progenitor, and a watcher-spawned worker opts out with `--no-pidfile`.
fn should_create_pidfile(cfg: &Config) -> bool {
    if cfg.no_pidfile || cfg.pidfile.is_empty() {
        return false;
    }
    matches!(cfg.role, Role::Watcher | Role::Worker)
}

/// Multi-threaded runtime; `GOMAXPROCS` is honoured when set, matching
/// the environment contract of the daemon this one replaces.
fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = std::env::var("GOMAXPROCS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
    {
        builder.worker_threads(threads);
    }
    builder.build()
}

fn banner(cfg: &Config) -> String {
    use std::fmt::Write;

    let mut buf = String::new();
    let _ = write!(
        buf,
        "teld version {} [listen={:?}",
        version::full(),
        cfg.bind_addr
    );
    let _ = write!(
        buf,
        " startup={}",
        if cfg.agent { "agent" } else { "init" }
    );
    let _ = write!(
        buf,
        " pid={} ppid={} uid={} euid={} gid={} egid={}",
        nix::unistd::getpid(),
        nix::unistd::getppid(),
        nix::unistd::getuid(),
        nix::unistd::geteuid(),
        nix::unistd::getgid(),
        nix::unistd::getegid(),
    );
    let _ = write!(
        buf,
        " workers={}]",
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    );
    buf
}
