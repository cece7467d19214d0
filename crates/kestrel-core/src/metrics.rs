//! Counters, gauges, and histograms.
//!
//! In the [`MetricsCollector`], counters are additive, gauges are
//! last-write-wins, and histograms are append-only summaries with fixed
//! bucket boundaries. All maps are ordered so that
//! [`MetricsSnapshot`] serializes identically for identical inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Upper bounds (inclusive) of the histogram buckets. Values above the last
/// bound land in the overflow bucket.
pub const HISTOGRAM_BOUNDS: [f64; 8] = [1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 10_000.0];

// ---------------------------------------------------------------------------
// HistogramSnapshot
// ---------------------------------------------------------------------------

/// Summary of every value recorded into one histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// One count per [`HISTOGRAM_BOUNDS`] entry plus a trailing overflow bucket.
    pub buckets: Vec<u64>,
}

impl HistogramSnapshot {
    fn empty() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buckets: vec![0; HISTOGRAM_BOUNDS.len() + 1],
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let bucket = HISTOGRAM_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(HISTOGRAM_BOUNDS.len());
        self.buckets[bucket] += 1;
    }

    /// Arithmetic mean, or `0.0` when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl MetricsSnapshot {
    /// Counter value, `0` if never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Collects named counters, gauges, and histograms.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, HistogramSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `by` to the counter `name`, creating it at zero first if needed.
    pub fn increment_counter(&mut self, name: &str, by: u64) {
        let counter = self.counters.entry(name.to_owned()).or_insert(0);
        *counter = counter.saturating_add(by);
    }

    /// Set gauge `name` to `value`.
    pub fn set_gauge(&mut self, name: &str, value: f64) {
        self.gauges.insert(name.to_owned(), value);
    }

    /// Record one observation into histogram `name`.
    pub fn record_histogram(&mut self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_owned())
            .or_insert_with(HistogramSnapshot::empty)
            .record(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            histograms: self.histograms.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
