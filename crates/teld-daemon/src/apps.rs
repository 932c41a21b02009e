//! Application table and per-application entries.
//!
//! The table maps application identities to entries; it is the only shared
//! structure on the observation hot path. Its lock is held just long
//! enough to clone out an entry handle — every observation merge and every
//! harvest swap happens under the entry's own lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use teld_core::harvest::{Harvest, HarvestBatch, HarvestLimits};
use teld_core::identity::AppIdentity;
use teld_core::reservoir::{AnalyticsEvent, Reservoir};
use teld_core::Config;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collector::{CollectorClient, ConnectOutcome};
use crate::protocol::messages::{ClientMessage, RejectReason, ServerMessage};
use crate::scheduler;
use crate::state::DaemonState;

/// Handle held by one open connection, registered weakly with its entry.
///
/// Presence in the entry's connection set is not ownership: when a
/// connection drops its handle, the weak reference dies with it and the
/// entry prunes it lazily. When an entry is evicted first, it closes the
/// handles that are still alive.
#[derive(Debug, Default)]
pub struct ConnHandle {
    closed: AtomicBool,
    notify: Notify,
}

impl ConnHandle {
    /// Create an open handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the handle is closed.
    pub async fn wait_closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a close between the check and
            // the registration is not missed.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Error raised when an observation cannot be merged.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// The entry lost its run token (permanent upload rejection); the
    /// connection must close so the library re-initiates the connect
    /// handshake.
    #[error("application entry is disconnected")]
    Disconnected,

    /// A connect frame arrived on an already-connected connection.
    #[error("connection already established")]
    UnexpectedConnect,
}

/// Monotonic diagnostic counters for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStats {
    /// Observation frames merged into the reservoirs.
    pub observations: u64,
    /// Harvest swaps taken.
    pub harvests: u64,
}

#[derive(Debug)]
struct EntryInner {
    harvest: Harvest,
    last_activity: DateTime<Utc>,
    run_token: Option<String>,
    connections: Vec<Weak<ConnHandle>>,
    stats: EntryStats,
}

/// Per-application aggregation state.
#[derive(Debug)]
pub struct AppEntry {
    identity: AppIdentity,
    inner: Mutex<EntryInner>,
}

impl AppEntry {
    fn new(identity: AppIdentity, limits: &HarvestLimits) -> Self {
        Self {
            identity,
            inner: Mutex::new(EntryInner {
                harvest: Harvest::new(limits),
                last_activity: Utc::now(),
                run_token: None,
                connections: Vec::new(),
                stats: EntryStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The identity this entry aggregates for.
    #[must_use]
    pub fn identity(&self) -> &AppIdentity {
        &self.identity
    }

    /// Merge one observation frame into the reservoirs.
    ///
    /// # Errors
    ///
    /// [`ObserveError::Disconnected`] when the entry has no run token and
    /// [`ObserveError::UnexpectedConnect`] for a stray connect frame; in
    /// both cases the caller closes the connection.
    pub fn observe(&self, msg: ClientMessage) -> Result<(), ObserveError> {
        let mut inner = self.lock();
        if inner.run_token.is_none() {
            return Err(ObserveError::Disconnected);
        }
        inner.last_activity = Utc::now();
        inner.stats.observations += 1;
        match msg {
            ClientMessage::Connect(_) => return Err(ObserveError::UnexpectedConnect),
            ClientMessage::Event { data } => {
                inner.harvest.events.observe(AnalyticsEvent { data });
            }
            ClientMessage::CustomEvent { data } => {
                inner.harvest.custom_events.observe(AnalyticsEvent { data });
            }
            ClientMessage::Metric { name, value } => {
                inner.harvest.metrics.observe_value(&name, value);
            }
            ClientMessage::TracedError(error) => inner.harvest.errors.observe(error),
            ClientMessage::SlowSample(sample) => inner.harvest.slow_samples.observe(sample),
        }
        Ok(())
    }

    /// Register a connection handle, pruning dead ones while at it.
    pub fn attach(&self, conn: &Arc<ConnHandle>) {
        let mut inner = self.lock();
        inner.connections.retain(|weak| weak.strong_count() > 0);
        inner.connections.push(Arc::downgrade(conn));
    }

    /// Close every connection still registered with this entry.
    pub fn close_connections(&self) {
        let connections = std::mem::take(&mut self.lock().connections);
        for conn in connections.iter().filter_map(Weak::upgrade) {
            conn.close();
        }
    }

    /// The current run token, if connected.
    #[must_use]
    pub fn run_token(&self) -> Option<String> {
        self.lock().run_token.clone()
    }

    /// Install a run token issued by the ingestion service.
    pub fn set_run_token(&self, token: String) {
        let mut inner = self.lock();
        inner.run_token = Some(token);
        inner.last_activity = Utc::now();
    }

    /// Drop the run token after a permanent upload rejection. The next
    /// incoming observation fails and its connection closes, forcing the
    /// library to re-initiate the connect handshake.
    pub fn mark_disconnected(&self) {
        self.lock().run_token = None;
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        self.lock().last_activity = Utc::now();
    }

    /// How long the entry has been idle.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.lock().last_activity;
        (Utc::now() - last).to_std().unwrap_or_default()
    }

    /// Retire the reservoirs. Returns the batch together with the run
    /// token as of the swap, both owned exclusively by the caller.
    pub fn swap(&self) -> (HarvestBatch, Option<String>) {
        let mut inner = self.lock();
        inner.stats.harvests += 1;
        let batch = inner.harvest.swap();
        (batch, inner.run_token.clone())
    }

    /// Diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> EntryStats {
        self.lock().stats
    }
}

/// The identity → entry mapping plus everything harvest tasks need.
#[derive(Debug)]
pub struct AppTable {
    apps: Mutex<HashMap<AppIdentity, Arc<AppEntry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    limits: HarvestLimits,
    app_timeout: Duration,
    harvest_period: Duration,
    collector: Arc<CollectorClient>,
    state: Arc<DaemonState>,
}

impl AppTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(cfg: &Config, collector: Arc<CollectorClient>, state: Arc<DaemonState>) -> Self {
        Self {
            apps: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            limits: HarvestLimits::default(),
            app_timeout: cfg.app_timeout.duration(),
            harvest_period: cfg.harvest_period.duration(),
            collector,
            state,
        }
    }

    fn lock_apps(&self) -> MutexGuard<'_, HashMap<AppIdentity, Arc<AppEntry>>> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a connect frame: reuse a live entry or perform the connect
    /// handshake against the ingestion service.
    ///
    /// No lock is held across the handshake.
    pub async fn connect(
        self: &Arc<Self>,
        identity: AppIdentity,
    ) -> (Option<Arc<AppEntry>>, ServerMessage) {
        if let Some(entry) = self.lookup(&identity) {
            if let Some(run_token) = entry.run_token() {
                entry.touch();
                return (Some(entry), ServerMessage::ConnectAccepted { run_token });
            }
        }

        match self.collector.connect(&identity).await {
            ConnectOutcome::Accepted { run_token } => {
                let entry = self.get_or_insert(identity);
                entry.set_run_token(run_token.clone());
                (Some(entry), ServerMessage::ConnectAccepted { run_token })
            }
            ConnectOutcome::Rejected(reason) => {
                info!(app = %identity, ?reason, "connect rejected");
                (None, ServerMessage::ConnectRejected { reason })
            }
            ConnectOutcome::Unavailable => (
                None,
                ServerMessage::ConnectRejected {
                    reason: RejectReason::Unavailable,
                },
            ),
        }
    }

    /// The entry for `identity`, if present.
    #[must_use]
    pub fn lookup(&self, identity: &AppIdentity) -> Option<Arc<AppEntry>> {
        self.lock_apps().get(identity).cloned()
    }

    fn get_or_insert(self: &Arc<Self>, identity: AppIdentity) -> Arc<AppEntry> {
        let (entry, created) = {
            let mut apps = self.lock_apps();
            match apps.get(&identity) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry = Arc::new(AppEntry::new(identity.clone(), &self.limits));
                    apps.insert(identity, Arc::clone(&entry));
                    (entry, true)
                }
            }
        };
        if created {
            debug!(app = %entry.identity(), "application entry created");
            scheduler::spawn(self, Arc::clone(&entry));
        }
        entry
    }

    /// Remove an evicted entry. Its harvest task exits on its own.
    pub fn remove(&self, identity: &AppIdentity) {
        if self.lock_apps().remove(identity).is_some() {
            info!(app = %identity, "application entry evicted");
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_apps().len()
    }

    /// True when no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Track a harvest task so shutdown can wait for its final harvest.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Wait for every harvest task to finish its final harvest.
    pub async fn join_harvesters(&self) {
        let handles = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Ingestion client shared by the harvest tasks.
    #[must_use]
    pub fn collector(&self) -> &Arc<CollectorClient> {
        &self.collector
    }

    /// Shared shutdown state.
    #[must_use]
    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Inactivity window for entry eviction.
    #[must_use]
    pub const fn app_timeout(&self) -> Duration {
        self.app_timeout
    }

    /// Length of one harvest cycle.
    #[must_use]
    pub const fn harvest_period(&self) -> Duration {
        self.harvest_period
    }
}
