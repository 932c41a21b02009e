//! Error reservoir: drop-newest at capacity.
//!
//! Errors keep arrival order and the oldest win: in a cascade the first
//! errors are the most likely to describe the root cause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Reservoir;

/// One captured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedError {
    /// When the error occurred.
    pub when: DateTime<Utc>,
    /// Name of the transaction the error occurred in.
    pub txn_name: String,
    /// Error message.
    pub message: String,
    /// Error class or category.
    pub klass: String,
    /// Opaque attribute blob from the instrumentation library.
    pub params: serde_json::Value,
}

/// Bounded, time-ordered error collection.
#[derive(Debug)]
pub struct ErrorReservoir {
    errors: Vec<TracedError>,
    capacity: usize,
}

impl ErrorReservoir {
    /// Create an empty reservoir retaining at most `capacity` errors.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            errors: Vec::new(),
            capacity,
        }
    }

    /// The retained errors, oldest first.
    #[must_use]
    pub fn errors(&self) -> &[TracedError] {
        &self.errors
    }
}

impl Reservoir for ErrorReservoir {
    type Item = TracedError;

    fn observe(&mut self, item: TracedError) {
        if self.errors.len() < self.capacity {
            self.errors.push(item);
        }
        // At capacity the newest observation is the one dropped.
    }

    fn merge(&mut self, other: Self) {
        for error in other.errors {
            self.observe(error);
        }
    }

    fn swap(&mut self) -> Self {
        std::mem::replace(self, Self::new(self.capacity))
    }

    fn len(&self) -> usize {
        self.errors.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(message: &str) -> TracedError {
        TracedError {
            when: Utc::now(),
            txn_name: "WebTransaction/Action/index".into(),
            message: message.into(),
            klass: "RuntimeError".into(),
            params: serde_json::json!({}),
        }
    }

    #[test]
    fn test_drop_newest_at_capacity() {
        let mut reservoir = ErrorReservoir::new(2);
        reservoir.observe(error("first"));
        reservoir.observe(error("second"));
        reservoir.observe(error("third"));

        let messages: Vec<_> = reservoir.errors().iter().map(|e| &e.message).collect();
        assert_eq!(messages, ["first", "second"]);
    }

    #[test]
    fn test_swap_returns_contents() {
        let mut reservoir = ErrorReservoir::new(4);
        reservoir.observe(error("only"));
        let retired = reservoir.swap();
        assert_eq!(retired.len(), 1);
        assert!(reservoir.is_empty());
        assert_eq!(reservoir.capacity(), 4);
    }
}
