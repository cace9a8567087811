//! Gauge metrics for values that can increase or decrease.

use super::counters::add_f64;
use std::sync::atomic::{AtomicU64, Ordering};

/// A floating-point gauge. Last write wins.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    // Store as bits for atomic operations
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge.
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the gauge help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Set the gauge to a specific value.
    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add to the gauge.
    pub fn add(&self, n: f64) {
        add_f64(&self.value, n);
    }

    /// Subtract from the gauge.
    pub fn sub(&self, n: f64) {
        add_f64(&self.value, -n);
    }

    /// Get the current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}
