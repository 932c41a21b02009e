//! Per-application harvest driver.
//!
//! Every application entry gets its own task running the harvest cycle:
//! swap the reservoirs under the entry lock, reduce each retired reservoir
//! independently, upload the payloads sequentially in a fixed order, and
//! fold the outcome. There is no retry buffer: accepted or not, a reduced
//! payload is gone after its upload attempt. That is the price of staying
//! memory-bounded.

use std::sync::Arc;

use teld_core::harvest::Payload;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::apps::{AppEntry, AppTable};
use crate::collector::{CollectorClient, UploadOutcome};

/// Spawn the harvest task for a freshly created entry.
pub(crate) fn spawn(table: &Arc<AppTable>, entry: Arc<AppEntry>) {
    let handle = tokio::spawn(run(Arc::clone(table), entry));
    table.track(handle);
}

async fn run(table: Arc<AppTable>, entry: Arc<AppEntry>) {
    let mut ticker = tokio::time::interval(table.harvest_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; consume it so the
    // first real harvest happens one full cycle after creation.
    ticker.tick().await;

    loop {
        let finishing = tokio::select! {
            _ = ticker.tick() => false,
            () = table.state().wait_shutdown() => true,
        };

        let idle = entry.idle_for() >= table.app_timeout();
        harvest_once(&entry, table.collector()).await;

        if finishing {
            break;
        }
        if idle {
            table.remove(entry.identity());
            entry.close_connections();
            break;
        }
    }
}

/// Run one harvest tick for `entry`: swap, reduce, upload, fold.
///
/// Public so tests can force a harvest without waiting out the cycle.
pub async fn harvest_once(entry: &AppEntry, collector: &CollectorClient) {
    let (batch, run_token) = entry.swap();

    // A disconnected entry has nowhere to upload to; the swap alone keeps
    // its memory bounded and the batch is discarded.
    let Some(run_token) = run_token else {
        return;
    };
    let license = &entry.identity().license;

    for payload in batch.payloads() {
        if payload.empty() {
            continue;
        }
        let body = match payload.data() {
            Ok(body) => body,
            Err(e) => {
                warn!(endpoint = payload.endpoint().method(), "cannot reduce payload: {e}");
                continue;
            }
        };

        match collector
            .submit(payload.endpoint(), license, &run_token, body)
            .await
        {
            UploadOutcome::Accepted => {}
            UploadOutcome::RejectedRetry => {
                debug!(
                    endpoint = payload.endpoint().method(),
                    "service unavailable, payload discarded"
                );
            }
            UploadOutcome::RejectedPermanent => {
                warn!(
                    app = %entry.identity(),
                    "run rejected by the ingestion service, forcing reconnect"
                );
                entry.mark_disconnected();
                // The token is dead; later payloads of this batch would
                // only be rejected the same way.
                break;
            }
        }
    }
}
