// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metrics sink abstraction.
//!
//! The core only emits; collection and exposition live outside. Metric
//! names are dot-separated with the varying dimension (modality, subsystem)
//! appended as the last segment, e.g. `queue.size.video`,
//! `errors.store.session`.

use std::collections::HashMap;
use std::sync::Mutex;

/// Destination for counter, gauge, and histogram updates.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to a monotonic counter.
    fn counter(&self, name: &str, value: u64);

    /// Set a gauge to an absolute value.
    fn gauge(&self, name: &str, value: f64);

    /// Record one observation, typically a duration in milliseconds.
    fn histogram(&self, name: &str, value: f64);
}

/// Sink that discards everything. The default when none is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn counter(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn histogram(&self, _name: &str, _value: f64) {}
}

/// In-memory sink for tests: keeps every update and answers queries.
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl RecordingSink {
    /// Fresh empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics mutex poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Last value written to a gauge.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges
            .lock()
            .expect("metrics mutex poisoned")
            .get(name)
            .copied()
    }

    /// All observations recorded under a histogram name.
    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.histograms
            .lock()
            .expect("metrics mutex poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingSink {
    fn counter(&self, name: &str, value: u64) {
        *self
            .counters
            .lock()
            .expect("metrics mutex poisoned")
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges
            .lock()
            .expect("metrics mutex poisoned")
            .insert(name.to_string(), value);
    }

    fn histogram(&self, name: &str, value: f64) {
        self.histograms
            .lock()
            .expect("metrics mutex poisoned")
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_accumulates() {
        let sink = RecordingSink::new();
        sink.counter("queue.join.video", 1);
        sink.counter("queue.join.video", 2);
        assert_eq!(sink.counter_value("queue.join.video"), 3);
        assert_eq!(sink.counter_value("queue.join.audio"), 0);

        sink.gauge("ws.connections", 4.0);
        sink.gauge("ws.connections", 2.0);
        assert_eq!(sink.gauge_value("ws.connections"), Some(2.0));

        sink.histogram("queue.wait_ms.video", 120.0);
        sink.histogram("queue.wait_ms.video", 80.0);
        assert_eq!(sink.histogram_values("queue.wait_ms.video"), vec![120.0, 80.0]);
    }
}
