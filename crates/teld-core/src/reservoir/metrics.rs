//! Metric aggregation table.
//!
//! Unlike the other reservoirs this one is keyed: observations for a known
//! metric name merge into its accumulated counters, so the table is
//! unbounded by observation count. The bound is on distinct names; once
//! the cap is reached new names are dropped and counted, and the drop
//! count is reported as a supportability metric at reduce time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Reservoir;

/// Name under which dropped-name spillover is reported.
pub const DROPPED_METRIC_NAME: &str = "Supportability/MetricsDropped";

/// Accumulated counters for one named metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    /// Number of observations merged in.
    pub count: u64,
    /// Sum of observed values.
    pub total: f64,
    /// Sum of squared observed values.
    pub sum_of_squares: f64,
    /// Smallest observed value.
    pub min: f64,
    /// Largest observed value.
    pub max: f64,
}

impl MetricData {
    /// Counters for a single observation of `value`.
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        Self {
            count: 1,
            total: value,
            sum_of_squares: value * value,
            min: value,
            max: value,
        }
    }

    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total += other.total;
        self.sum_of_squares += other.sum_of_squares;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// Bounded mapping from metric name to accumulated counters.
#[derive(Debug)]
pub struct MetricTable {
    metrics: HashMap<String, MetricData>,
    max_names: usize,
    dropped: u64,
}

impl MetricTable {
    /// Create an empty table admitting at most `max_names` distinct names.
    #[must_use]
    pub fn new(max_names: usize) -> Self {
        Self {
            metrics: HashMap::new(),
            max_names,
            dropped: 0,
        }
    }

    /// Record a single observation of `value` for `name`.
    pub fn observe_value(&mut self, name: &str, value: f64) {
        self.observe_data(name, MetricData::from_value(value));
    }

    /// Merge pre-accumulated counters for `name`.
    ///
    /// A known name always merges. An unknown name is admitted only while
    /// the table is below its distinct-name cap; otherwise the counters
    /// are dropped and the spillover counter incremented.
    pub fn observe_data(&mut self, name: &str, data: MetricData) {
        if let Some(existing) = self.metrics.get_mut(name) {
            existing.merge(&data);
            return;
        }
        if self.metrics.len() >= self.max_names {
            self.dropped += 1;
            return;
        }
        self.metrics.insert(name.to_string(), data);
    }

    /// Counters for `name`, if retained.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricData> {
        self.metrics.get(name)
    }

    /// Observations rejected because the distinct-name cap was reached.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Retained entries in deterministic (name) order.
    #[must_use]
    pub fn sorted_entries(&self) -> Vec<(&str, &MetricData)> {
        let mut entries: Vec<_> = self
            .metrics
            .iter()
            .map(|(name, data)| (name.as_str(), data))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}

impl Reservoir for MetricTable {
    type Item = (String, MetricData);

    fn observe(&mut self, item: Self::Item) {
        self.observe_data(&item.0, item.1);
    }

    fn merge(&mut self, other: Self) {
        for (name, data) in other.metrics {
            self.observe_data(&name, data);
        }
        self.dropped += other.dropped;
    }

    fn swap(&mut self) -> Self {
        std::mem::replace(self, Self::new(self.max_names))
    }

    fn len(&self) -> usize {
        self.metrics.len()
    }

    fn capacity(&self) -> usize {
        self.max_names
    }
}
