//! Counter metrics for monotonically increasing values.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomically add `delta` to an `f64` stored as bits.
pub(crate) fn add_f64(cell: &AtomicU64, delta: f64) {
    loop {
        let current = cell.load(Ordering::Relaxed);
        let new_value = f64::from_bits(current) + delta;
        if cell
            .compare_exchange_weak(
                current,
                new_value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            break;
        }
    }
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    // Stored as f64 bits so fractional increments are allowed.
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.inc_by(1.0);
    }

    /// Increment the counter by a specific amount.
    ///
    /// Negative or non-finite amounts are ignored; counters never decrease.
    pub fn inc_by(&self, n: f64) {
        if n.is_finite() && n > 0.0 {
            add_f64(&self.value, n);
        }
    }

    /// Get the current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }

    /// Reset the counter to zero.
    pub fn reset(&self) {
        self.value.store(0f64.to_bits(), Ordering::Relaxed);
    }
}
