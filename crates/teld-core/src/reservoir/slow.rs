//! Slow-sample reservoir: keep the slowest.
//!
//! Samples deduplicate by identifier, so a hot statement occupies one slot
//! no matter how often it is observed. At capacity a new identifier is
//! admitted only if its peak duration beats the smallest peak currently
//! retained, which it then replaces. The reservoir therefore converges on
//! the slowest statements seen during the harvest cycle.

use serde::{Deserialize, Serialize};

use super::Reservoir;

/// Aggregated record of a notable slow operation.
///
/// Identifiers are generated by the reporting library; two samples with
/// the same identifier describe the same underlying statement. When
/// `count > 1` the descriptive fields come from the slowest observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowSample {
    /// Unique identifier generated by the reporting library.
    pub id: u32,
    /// Number of times the statement was observed.
    pub count: u64,
    /// Cumulative duration in microseconds.
    pub total_micros: u64,
    /// Minimum observed duration in microseconds.
    pub min_micros: u64,
    /// Maximum observed duration in microseconds.
    pub max_micros: u64,
    /// Metric name derived from the statement.
    pub metric_name: String,
    /// The literal query text.
    pub query: String,
    /// Name of the originating transaction.
    pub txn_name: String,
    /// URL of the originating request.
    pub txn_url: String,
    /// Opaque parameter blob (backtrace, API attributes, ...).
    pub params: serde_json::Value,
}

impl SlowSample {
    /// Fold another sample with the same identifier into this one.
    ///
    /// Counts and totals add and the duration extremes widen. When the
    /// other sample carries a new maximum, every descriptive field is
    /// overwritten from it: the reservoir keeps the metadata of the
    /// slowest seen instance only.
    pub fn merge(&mut self, other: SlowSample) {
        self.count += other.count;
        self.total_micros += other.total_micros;

        if other.min_micros < self.min_micros {
            self.min_micros = other.min_micros;
        }
        if other.max_micros > self.max_micros {
            self.max_micros = other.max_micros;
            self.query = other.query;
            self.metric_name = other.metric_name;
            self.params = other.params;
            self.txn_name = other.txn_name;
            self.txn_url = other.txn_url;
        }
    }
}

/// Bounded collection of slow samples, addressed by identifier.
#[derive(Debug)]
pub struct SlowSampleReservoir {
    samples: Vec<SlowSample>,
    capacity: usize,
}

impl SlowSampleReservoir {
    /// Create an empty reservoir retaining at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity,
        }
    }

    /// The retained samples, in admission order.
    #[must_use]
    pub fn samples(&self) -> &[SlowSample] {
        &self.samples
    }

    /// Index of the retained sample with the smallest maximum duration.
    ///
    /// Ties resolve to the first in scan order; only which of two equally
    /// slow statements survives depends on it, none of the cumulative
    /// statistics. The scan is O(capacity), which is configured small.
    fn fastest(&self) -> Option<usize> {
        let mut min_idx = None;
        let mut min_of_max = u64::MAX;
        for (idx, sample) in self.samples.iter().enumerate() {
            if min_idx.is_none() || sample.max_micros < min_of_max {
                min_of_max = sample.max_micros;
                min_idx = Some(idx);
            }
        }
        min_idx
    }

    fn find_mut(&mut self, id: u32) -> Option<&mut SlowSample> {
        self.samples.iter_mut().find(|s| s.id == id)
    }
}

impl Reservoir for SlowSampleReservoir {
    type Item = SlowSample;

    fn observe(&mut self, item: SlowSample) {
        if let Some(existing) = self.find_mut(item.id) {
            existing.merge(item);
            return;
        }
        if self.samples.len() >= self.capacity {
            if let Some(victim) = self.fastest() {
                if self.samples[victim].max_micros < item.max_micros {
                    self.samples[victim] = item;
                }
            }
            return;
        }
        self.samples.push(item);
    }

    fn merge(&mut self, other: Self) {
        for sample in other.samples {
            self.observe(sample);
        }
    }

    fn swap(&mut self) -> Self {
        std::mem::replace(self, Self::new(self.capacity))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u32, max_micros: u64) -> SlowSample {
        SlowSample {
            id,
            count: 1,
            total_micros: max_micros,
            min_micros: max_micros,
            max_micros,
            metric_name: format!("Datastore/statement/{id}"),
            query: format!("SELECT {id}"),
            txn_name: "WebTransaction/Action/index".into(),
            txn_url: "/index".into(),
            params: serde_json::json!({}),
        }
    }

    fn sample_with_query(id: u32, max_micros: u64, query: &str) -> SlowSample {
        SlowSample {
            query: query.into(),
            ..sample(id, max_micros)
        }
    }

    fn retained_maxes(reservoir: &SlowSampleReservoir) -> Vec<u64> {
        let mut maxes: Vec<_> = reservoir.samples().iter().map(|s| s.max_micros).collect();
        maxes.sort_unstable();
        maxes
    }

    // Admission scenario: {10, 20, 30} fills the reservoir, {5} is too
    // fast to displace anything, {25} evicts the record with max 10.
    #[test]
    fn test_admission_replaces_fastest() {
        let mut reservoir = SlowSampleReservoir::new(3);
        for (id, max) in [(1, 10), (2, 20), (3, 30), (4, 5), (5, 25)] {
            reservoir.observe(sample(id, max));
        }
        assert_eq!(retained_maxes(&reservoir), [20, 25, 30]);
    }

    #[test]
    fn test_duplicate_id_merges_instead_of_evicting() {
        let mut reservoir = SlowSampleReservoir::new(1);
        reservoir.observe(sample_with_query(7, 100, "A"));
        reservoir.observe(sample_with_query(7, 150, "B"));

        let retained = &reservoir.samples()[0];
        assert_eq!(retained.count, 2);
        assert_eq!(retained.max_micros, 150);
        assert_eq!(retained.min_micros, 100);
        assert_eq!(retained.total_micros, 250);
        assert_eq!(retained.query, "B");
    }

    #[test]
    fn test_slower_observation_carries_all_descriptive_fields() {
        let mut reservoir = SlowSampleReservoir::new(4);
        reservoir.observe(sample_with_query(1, 100, "fast variant"));

        let mut slower = sample_with_query(1, 900, "slow variant");
        slower.txn_name = "WebTransaction/Action/report".into();
        slower.txn_url = "/report".into();
        slower.metric_name = "Datastore/statement/report".into();
        slower.params = serde_json::json!({ "plan": "seq scan" });
        reservoir.observe(slower);

        let retained = &reservoir.samples()[0];
        assert_eq!(retained.query, "slow variant");
        assert_eq!(retained.txn_name, "WebTransaction/Action/report");
        assert_eq!(retained.txn_url, "/report");
        assert_eq!(retained.metric_name, "Datastore/statement/report");
        assert_eq!(retained.params, serde_json::json!({ "plan": "seq scan" }));
    }

    #[test]
    fn test_faster_observation_keeps_existing_metadata() {
        let mut reservoir = SlowSampleReservoir::new(4);
        reservoir.observe(sample_with_query(1, 900, "slow variant"));
        reservoir.observe(sample_with_query(1, 100, "fast variant"));

        let retained = &reservoir.samples()[0];
        assert_eq!(retained.query, "slow variant");
        assert_eq!(retained.min_micros, 100);
        assert_eq!(retained.max_micros, 900);
    }

    #[test]
    fn test_merge_is_associative_on_counters() {
        let a = sample_with_query(9, 10, "a");
        let b = sample_with_query(9, 30, "b");
        let c = sample_with_query(9, 20, "c");

        let mut left = a.clone();
        left.merge(b.clone());
        left.merge(c.clone());

        let mut bc = b;
        bc.merge(c);
        let mut right = a;
        right.merge(bc);

        assert_eq!(left.count, right.count);
        assert_eq!(left.total_micros, right.total_micros);
        assert_eq!(left.min_micros, right.min_micros);
        assert_eq!(left.max_micros, right.max_micros);
        // Descriptive fields follow the maximum, wherever it sat.
        assert_eq!(left.query, "b");
        assert_eq!(right.query, "b");
    }

    #[test]
    fn test_merge_with_self_shape() {
        let original = sample_with_query(3, 40, "q");
        let mut merged = original.clone();
        merged.merge(original.clone());

        assert_eq!(merged.count, 2);
        assert_eq!(merged.total_micros, 80);
        assert_eq!(merged.min_micros, original.min_micros);
        assert_eq!(merged.max_micros, original.max_micros);
        assert_eq!(merged.query, original.query);
        assert_eq!(merged.params, original.params);
    }

    #[test]
    fn test_retained_minimum_bounds_admission() {
        let mut reservoir = SlowSampleReservoir::new(2);
        for (id, max) in [(1, 50), (2, 70), (3, 60), (4, 10), (5, 80)] {
            reservoir.observe(sample(id, max));
            let floor = reservoir
                .samples()
                .iter()
                .map(|s| s.max_micros)
                .min()
                .unwrap();
            for s in reservoir.samples() {
                assert!(s.max_micros >= floor);
            }
            assert!(reservoir.len() <= 2);
        }
        assert_eq!(retained_maxes(&reservoir), [70, 80]);
    }

    #[test]
    fn test_tie_on_fastest_resolves_to_first() {
        let mut reservoir = SlowSampleReservoir::new(2);
        reservoir.observe(sample(1, 30));
        reservoir.observe(sample(2, 30));
        reservoir.observe(sample(3, 40));

        let ids: Vec<_> = reservoir.samples().iter().map(|s| s.id).collect();
        assert_eq!(ids, [3, 2]);
    }
}
