//! Per-application harvest state and payload reduction.
//!
//! A [`Harvest`] bundles the reservoirs for one application entry. On each
//! harvest tick the scheduler calls [`Harvest::swap`] under the entry lock
//! to retire the reservoirs as a [`HarvestBatch`], then reduces and uploads
//! the batch with no lock held. Upload payloads are never persisted: every
//! outcome, success or failure, discards them.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::encode::compress_encode;
use crate::reservoir::{
    ErrorReservoir, EventReservoir, MetricTable, Reservoir, SlowSampleReservoir,
    DROPPED_METRIC_NAME,
};

/// Reservoir capacities for one application entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestLimits {
    /// Analytics event reservoir capacity.
    pub analytics_events: usize,
    /// Custom event reservoir capacity.
    pub custom_events: usize,
    /// Distinct-name cap of the metric table.
    pub metric_names: usize,
    /// Error reservoir capacity.
    pub errors: usize,
    /// Slow-sample reservoir capacity.
    pub slow_samples: usize,
}

impl Default for HarvestLimits {
    fn default() -> Self {
        Self {
            analytics_events: 10_000,
            custom_events: 10_000,
            metric_names: 2_000,
            errors: 20,
            slow_samples: 10,
        }
    }
}

/// Upload endpoints recognised by the ingestion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Aggregated metric counters.
    MetricData,
    /// Captured errors.
    ErrorData,
    /// Sampled transaction analytics events.
    AnalyticEventData,
    /// Sampled custom events.
    CustomEventData,
    /// Slow-operation samples.
    SlowSampleData,
}

impl Endpoint {
    /// Method name as carried in the upload URL.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::MetricData => "metric_data",
            Self::ErrorData => "error_data",
            Self::AnalyticEventData => "analytic_event_data",
            Self::CustomEventData => "custom_event_data",
            Self::SlowSampleData => "slow_sample_data",
        }
    }
}

/// Error raised while reducing a retired reservoir to its upload payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// JSON serialisation failed.
    #[error("cannot serialise payload: {0}")]
    Serialise(#[from] serde_json::Error),

    /// Parameter compression failed.
    #[error("cannot encode parameters: {0}")]
    Encode(#[from] std::io::Error),
}

/// The capability every retired reservoir exposes to the uploader.
///
/// The scheduler drives reduction through this trait rather than through
/// the concrete reservoir types, so adding a reservoir kind does not touch
/// the upload path.
pub trait Payload: Send {
    /// Endpoint the payload is submitted to.
    fn endpoint(&self) -> Endpoint;

    /// True when there is nothing to upload; empty payloads are skipped.
    fn empty(&self) -> bool;

    /// Wire rendering of the payload.
    ///
    /// The application-run identity is deliberately absent: it travels in
    /// the request URL.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] if serialisation or encoding fails.
    fn data(&self) -> Result<Vec<u8>, PayloadError>;

    /// Audit rendering: same shape with compression disabled, to keep the
    /// audit log readable.
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] if serialisation fails.
    fn audit(&self) -> Result<Vec<u8>, PayloadError> {
        self.data()
    }
}

/// The reservoir bundle owned by one application entry.
#[derive(Debug)]
pub struct Harvest {
    /// Sampled transaction analytics events.
    pub events: EventReservoir,
    /// Sampled custom events.
    pub custom_events: EventReservoir,
    /// Aggregated metric counters.
    pub metrics: MetricTable,
    /// Captured errors.
    pub errors: ErrorReservoir,
    /// Slow-operation samples.
    pub slow_samples: SlowSampleReservoir,
    /// When the previous harvest was taken.
    pub last_harvest: DateTime<Utc>,
}

impl Harvest {
    /// Create an empty harvest state with the given capacities.
    #[must_use]
    pub fn new(limits: &HarvestLimits) -> Self {
        Self {
            events: EventReservoir::new(limits.analytics_events),
            custom_events: EventReservoir::new(limits.custom_events),
            metrics: MetricTable::new(limits.metric_names),
            errors: ErrorReservoir::new(limits.errors),
            slow_samples: SlowSampleReservoir::new(limits.slow_samples),
            last_harvest: Utc::now(),
        }
    }

    /// Retire every reservoir, leaving empty ones of the same capacities.
    ///
    /// The caller must hold the entry lock for the swap to be a single
    /// observable event; afterwards the returned batch is owned
    /// exclusively by the harvest tick and needs no locking.
    pub fn swap(&mut self) -> HarvestBatch {
        let started = Utc::now();
        self.last_harvest = started;
        HarvestBatch {
            started,
            events: self.events.swap(),
            custom_events: self.custom_events.swap(),
            metrics: self.metrics.swap(),
            errors: self.errors.swap(),
            slow_samples: self.slow_samples.swap(),
        }
    }

    /// True when every reservoir is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.custom_events.is_empty()
            && self.metrics.is_empty()
            && self.errors.is_empty()
            && self.slow_samples.is_empty()
    }
}

/// The retired reservoirs of one harvest tick.
#[derive(Debug)]
pub struct HarvestBatch {
    /// When the swap was taken.
    pub started: DateTime<Utc>,
    /// Retired analytics events.
    pub events: EventReservoir,
    /// Retired custom events.
    pub custom_events: EventReservoir,
    /// Retired metric table.
    pub metrics: MetricTable,
    /// Retired errors.
    pub errors: ErrorReservoir,
    /// Retired slow samples.
    pub slow_samples: SlowSampleReservoir,
}

impl HarvestBatch {
    /// The retired reservoirs behind the [`Payload`] capability, in the
    /// fixed upload order. The order never changes so a failure of a later
    /// payload cannot retroactively invalidate an earlier success.
    #[must_use]
    pub fn payloads(&self) -> Vec<Box<dyn Payload + '_>> {
        vec![
            Box::new(MetricPayload { table: &self.metrics }),
            Box::new(ErrorPayload { errors: &self.errors }),
            Box::new(EventPayload {
                endpoint: Endpoint::AnalyticEventData,
                events: &self.events,
            }),
            Box::new(EventPayload {
                endpoint: Endpoint::CustomEventData,
                events: &self.custom_events,
            }),
            Box::new(SlowSamplePayload {
                samples: &self.slow_samples,
            }),
        ]
    }
}

struct EventPayload<'a> {
    endpoint: Endpoint,
    events: &'a EventReservoir,
}

impl Payload for EventPayload<'_> {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn empty(&self) -> bool {
        self.events.is_empty()
    }

    fn data(&self) -> Result<Vec<u8>, PayloadError> {
        let bodies: Vec<_> = self.events.events().iter().map(|e| &e.data).collect();
        Ok(serde_json::to_vec(&bodies)?)
    }
}

struct MetricPayload<'a> {
    table: &'a MetricTable,
}

impl Payload for MetricPayload<'_> {
    fn endpoint(&self) -> Endpoint {
        Endpoint::MetricData
    }

    fn empty(&self) -> bool {
        self.table.is_empty() && self.table.dropped() == 0
    }

    #[allow(clippy::cast_precision_loss)]
    fn data(&self) -> Result<Vec<u8>, PayloadError> {
        let mut rows: Vec<serde_json::Value> = self
            .table
            .sorted_entries()
            .into_iter()
            .map(|(name, data)| {
                json!([
                    { "name": name },
                    [data.count, data.total, data.sum_of_squares, data.min, data.max],
                ])
            })
            .collect();
        if self.table.dropped() > 0 {
            rows.push(json!([
                { "name": DROPPED_METRIC_NAME },
                [self.table.dropped(), 0.0, 0.0, 0.0, 0.0],
            ]));
        }
        Ok(serde_json::to_vec(&rows)?)
    }
}

struct ErrorPayload<'a> {
    errors: &'a ErrorReservoir,
}

impl Payload for ErrorPayload<'_> {
    fn endpoint(&self) -> Endpoint {
        Endpoint::ErrorData
    }

    fn empty(&self) -> bool {
        self.errors.is_empty()
    }

    fn data(&self) -> Result<Vec<u8>, PayloadError> {
        let rows: Vec<serde_json::Value> = self
            .errors
            .errors()
            .iter()
            .map(|e| {
                json!([
                    e.when.timestamp_millis(),
                    e.txn_name,
                    e.message,
                    e.klass,
                    e.params,
                ])
            })
            .collect();
        Ok(serde_json::to_vec(&rows)?)
    }
}

struct SlowSamplePayload<'a> {
    samples: &'a SlowSampleReservoir,
}

impl SlowSamplePayload<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn rows(&self, compress: bool) -> Result<Vec<u8>, PayloadError> {
        let millis = |micros: u64| micros as f64 / 1000.0;
        let rows = self
            .samples
            .samples()
            .iter()
            .map(|s| {
                let params = if compress {
                    let raw = serde_json::to_vec(&s.params)?;
                    serde_json::Value::String(compress_encode(&raw)?)
                } else {
                    s.params.clone()
                };
                Ok(json!([
                    s.txn_name,
                    s.txn_url,
                    s.id,
                    s.query,
                    s.metric_name,
                    s.count,
                    millis(s.total_micros),
                    millis(s.min_micros),
                    millis(s.max_micros),
                    params,
                ]))
            })
            .collect::<Result<Vec<serde_json::Value>, PayloadError>>()?;
        // Single-element outer wrapper, per the ingestion schema.
        Ok(serde_json::to_vec(&json!([rows]))?)
    }
}

impl Payload for SlowSamplePayload<'_> {
    fn endpoint(&self) -> Endpoint {
        Endpoint::SlowSampleData
    }

    fn empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn data(&self) -> Result<Vec<u8>, PayloadError> {
        self.rows(true)
    }

    fn audit(&self) -> Result<Vec<u8>, PayloadError> {
        self.rows(false)
    }
}
