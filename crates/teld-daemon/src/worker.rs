//! Worker role runtime.
//!
//! The worker is the process that actually serves: it binds the listener,
//! owns the application table, and lets the per-application harvest tasks
//! run until a terminating signal arrives. Shutdown is orderly: stop
//! accepting, give in-flight reads a bounded grace period, then wait for
//! every entry's final harvest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use teld_core::Config;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::apps::AppTable;
use crate::collector::CollectorClient;
use crate::listener::{self, ListenAddr, Listener};
use crate::log::LogHandle;
use crate::state::DaemonState;

/// Grace period for in-flight connection reads after the listener stops.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// How long shutdown waits for the final harvests.
const FINAL_HARVEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the worker until signalled.
///
/// # Errors
///
/// Returns an error when initialisation fails (ingest client, listener
/// bind); runtime failures after that are handled locally per connection
/// or per harvest.
pub async fn run(cfg: &Config, log: Option<LogHandle>) -> anyhow::Result<()> {
    raise_file_limit(cfg.max_files);

    let collector =
        Arc::new(CollectorClient::new(cfg).context("cannot initialise ingest client")?);
    let state = Arc::new(DaemonState::new());
    let table = Arc::new(AppTable::new(cfg, collector, Arc::clone(&state)));

    let addr = ListenAddr::parse(&cfg.bind_addr);
    let bound = Listener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind listener on {addr}"))?;
    info!(%addr, "listening for connections");

    spawn_signal_dispatcher(Arc::clone(&state), log);

    listener::run(bound, Arc::clone(&table)).await;

    // Let in-flight reads notice the shutdown before the final harvests.
    tokio::time::sleep(DRAIN_GRACE).await;

    if tokio::time::timeout(FINAL_HARVEST_TIMEOUT, table.join_harvesters())
        .await
        .is_err()
    {
        warn!("timed out waiting for final harvests");
    }

    info!("worker shutdown complete");
    Ok(())
}

/// Translate OS signals into state changes. Nothing else runs in signal
/// context: SIGTERM and SIGINT request the drain, SIGHUP reopens the log.
fn spawn_signal_dispatcher(state: Arc<DaemonState>, log: Option<LogHandle>) {
    tokio::spawn(async move {
        let (Ok(mut sigterm), Ok(mut sigint), Ok(mut sighup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) else {
            error!("cannot install signal handlers");
            state.request_shutdown();
            return;
        };

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, draining");
                    state.request_shutdown();
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, draining");
                    state.request_shutdown();
                }
                _ = sighup.recv() => match &log {
                    Some(handle) => match handle.reopen() {
                        Ok(()) => info!("log file reopened"),
                        Err(e) => warn!("cannot reopen log file: {e}"),
                    },
                    None => info!("received SIGHUP, no log file to reopen"),
                },
            }
        }
    });
}

fn raise_file_limit(max_files: u64) {
    if max_files == 0 {
        return;
    }
    use nix::sys::resource::{setrlimit, Resource};
    if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, max_files, max_files) {
        warn!(max_files, "cannot raise open file limit: {e}");
    }
}
