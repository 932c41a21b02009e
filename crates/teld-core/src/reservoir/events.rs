//! Event reservoir: uniform random replacement.
//!
//! Analytics events and custom events share this kind. The replacement
//! rule is classic reservoir sampling: after `seen` observations each one
//! has probability `capacity / seen` of being retained, no matter when it
//! arrived.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::Reservoir;

/// A single event observation.
///
/// The daemon treats the body as opaque: it is produced by the
/// instrumentation library and forwarded to the ingestion service verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    /// Opaque event body.
    pub data: serde_json::Value,
}

/// Bounded event sampler with uniform random replacement.
#[derive(Debug)]
pub struct EventReservoir {
    events: Vec<AnalyticsEvent>,
    capacity: usize,
    seen: u64,
    rng: SmallRng,
}

impl EventReservoir {
    /// Create an empty reservoir retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            seen: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Create a reservoir with a deterministic random source, for tests
    /// that assert the sampling distribution.
    #[must_use]
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            seen: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Total observations admitted, including ones no longer retained.
    #[must_use]
    pub const fn seen(&self) -> u64 {
        self.seen
    }

    /// The retained events, in slot order.
    #[must_use]
    pub fn events(&self) -> &[AnalyticsEvent] {
        &self.events
    }
}

impl Reservoir for EventReservoir {
    type Item = AnalyticsEvent;

    fn observe(&mut self, item: AnalyticsEvent) {
        self.seen += 1;
        if self.events.len() < self.capacity {
            self.events.push(item);
            return;
        }
        if self.capacity == 0 {
            return;
        }
        // Algorithm R: the new event displaces a uniformly chosen victim
        // with probability capacity / seen.
        let r = self.rng.gen_range(0..self.seen);
        if let Ok(slot) = usize::try_from(r) {
            if slot < self.capacity {
                self.events[slot] = item;
            }
        }
    }

    fn merge(&mut self, other: Self) {
        let discarded = other.seen - other.events.len() as u64;
        for event in other.events {
            self.observe(event);
        }
        // Observations the other reservoir had already discarded still
        // count towards the admission probability of future events.
        self.seen += discarded;
    }

    fn swap(&mut self) -> Self {
        std::mem::replace(self, Self::new(self.capacity))
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> AnalyticsEvent {
        AnalyticsEvent {
            data: serde_json::json!({ "id": id }),
        }
    }

    fn retained_ids(reservoir: &EventReservoir) -> Vec<u64> {
        reservoir
            .events()
            .iter()
            .map(|e| e.data["id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_bounded_by_capacity() {
        let mut reservoir = EventReservoir::with_seed(4, 7);
        for i in 0..1000 {
            reservoir.observe(event(i));
            assert!(reservoir.len() <= 4);
        }
        assert_eq!(reservoir.seen(), 1000);
        assert_eq!(reservoir.len(), 4);
    }

    #[test]
    fn test_swap_leaves_empty_reservoir() {
        let mut reservoir = EventReservoir::with_seed(8, 1);
        for i in 0..20 {
            reservoir.observe(event(i));
        }
        let retired = reservoir.swap();
        assert_eq!(retired.len(), 8);
        assert_eq!(retired.seen(), 20);
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.seen(), 0);
        assert_eq!(reservoir.capacity(), 8);
    }

    #[test]
    fn test_merge_accounts_for_discarded_events() {
        let mut a = EventReservoir::with_seed(2, 3);
        let mut b = EventReservoir::with_seed(2, 4);
        for i in 0..50 {
            a.observe(event(i));
            b.observe(event(100 + i));
        }
        a.merge(b);
        assert!(a.len() <= 2);
        assert_eq!(a.seen(), 100);
    }

    // Scenario: with capacity 2 and 1000 observations, every event should
    // be retained with probability close to 2/1000. Across 300 seeds each
    // event id is a Bernoulli trial; 3 sigma around the mean bounds the
    // expected hit count.
    #[test]
    fn test_sampling_is_uniform_within_three_sigma() {
        const CAPACITY: usize = 2;
        const EVENTS: u64 = 1000;
        const RUNS: u64 = 300;

        let mut hits = vec![0u64; EVENTS as usize];
        for seed in 0..RUNS {
            let mut reservoir = EventReservoir::with_seed(CAPACITY, seed);
            for i in 0..EVENTS {
                reservoir.observe(event(i));
            }
            for id in retained_ids(&reservoir) {
                hits[usize::try_from(id).unwrap()] += 1;
            }
        }

        let p = CAPACITY as f64 / EVENTS as f64;
        let mean = RUNS as f64 * p;
        let sigma = (RUNS as f64 * p * (1.0 - p)).sqrt();
        let lo = mean - 3.0 * sigma;
        let hi = mean + 3.0 * sigma;

        // With a hit mean of 0.6 roughly 2% of ids land at 3+ hits by
        // chance, so allow for that tail and a wide margin on top.
        let outliers = hits
            .iter()
            .filter(|&&h| (h as f64) < lo || (h as f64) > hi)
            .count();
        assert!(
            outliers < EVENTS as usize / 20,
            "{outliers} of {EVENTS} ids fell outside 3 sigma"
        );
    }
}
