//! Bounded in-memory samplers.
//!
//! A reservoir is a bounded container with an attached replacement rule.
//! Regardless of kind, three invariants hold:
//!
//! 1. The number of retained samples never exceeds the configured capacity.
//! 2. [`Reservoir::swap`] returns the current contents and leaves an empty
//!    reservoir of the same capacity in place; from the observer's point
//!    of view the swap is a single event, so every observation lands in
//!    exactly one harvest.
//! 3. Observation order does not affect the retained set beyond what the
//!    kind's rule prescribes.

pub mod errors;
pub mod events;
pub mod metrics;
pub mod slow;

pub use errors::{ErrorReservoir, TracedError};
pub use events::{AnalyticsEvent, EventReservoir};
pub use metrics::{MetricData, MetricTable, DROPPED_METRIC_NAME};
pub use slow::{SlowSample, SlowSampleReservoir};

/// The capability set shared by every reservoir kind.
pub trait Reservoir {
    /// Observation type admitted by this reservoir.
    type Item;

    /// Admit one observation, applying the kind's replacement rule.
    /// Amortised O(1) except where a kind documents otherwise.
    fn observe(&mut self, item: Self::Item);

    /// Fold another reservoir of the same kind into this one. The merged
    /// result obeys the same replacement rule as a single reservoir that
    /// had seen both observation streams.
    fn merge(&mut self, other: Self);

    /// Retire the current contents, leaving an empty reservoir of the
    /// same capacity in place.
    #[must_use]
    fn swap(&mut self) -> Self;

    /// Number of retained samples.
    fn len(&self) -> usize;

    /// Maximum number of retained samples.
    fn capacity(&self) -> usize;

    /// True when nothing is retained.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
