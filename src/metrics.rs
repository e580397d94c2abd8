//! Observability: per-request ids, histogram metrics, engine counters.
//! Histograms track p50/p95/p99 (microseconds) for every timing point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Identifier attached to every request flowing through the engine.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A span measuring elapsed time from creation to explicit end.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// End the span, recording elapsed duration in microseconds.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }

    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_micros() as f64
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

/// Stores histograms for all named metrics.
pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: 1024,
        }
    }

    /// Record a sample (in microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        let mut hists = self.histograms.lock();
        hists
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us = value_us, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile for a metric (p in 0-100), microseconds.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        let hists = self.histograms.lock();
        hists.get(name).map(|ring| ring.percentile(p)).unwrap_or(0.0)
    }

    /// Summary of all metrics at p50/p95/p99.
    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let hists = self.histograms.lock();
        hists
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.count,
                    },
                )
            })
            .collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

/// Request counters, updated by the serialized execution slot and by admission.
#[derive(Default)]
pub struct EngineCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    empty_input: AtomicU64,
    queue_rejections: AtomicU64,
    timeouts: AtomicU64,
    total_processing_us: AtomicU64,
}

impl EngineCounters {
    pub fn record_success(&self, processing_us: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.total_processing_us
            .fetch_add(processing_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty(&self) {
        self.empty_input.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_rejection(&self) {
        self.queue_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let successful = self.successful.load(Ordering::Relaxed);
        let total_us = self.total_processing_us.load(Ordering::Relaxed);
        CounterSnapshot {
            total_translations: self.total.load(Ordering::Relaxed),
            successful_translations: successful,
            failed_translations: self.failed.load(Ordering::Relaxed),
            empty_inputs: self.empty_input.load(Ordering::Relaxed),
            queue_rejections: self.queue_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_processing_ms: if successful == 0 {
                0.0
            } else {
                total_us as f64 / successful as f64 / 1000.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub total_translations: u64,
    pub successful_translations: u64,
    pub failed_translations: u64,
    pub empty_inputs: u64,
    pub queue_rejections: u64,
    pub timeouts: u64,
    pub average_processing_ms: f64,
}

/// Well-known metric names.
pub mod metric_names {
    pub const QUEUE_WAIT: &str = "queue_wait";
    pub const RATE_LIMIT_WAIT: &str = "rate_limit_wait";
    pub const PIPELINE_DONE: &str = "t_pipeline_done";
    pub const TRANSLATE_DONE: &str = "t_translate_done";
    pub const LAYER_DONE: &str = "t_layer_done";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::PIPELINE_DONE, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::PIPELINE_DONE, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::PIPELINE_DONE, 99.0), 99.0);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);
        let summary = registry.summary();
        assert_eq!(summary[metric_names::PIPELINE_DONE].count, 100);
    }

    #[test]
    fn ring_keeps_latest_samples() {
        let mut ring = SampleRing::new(4);
        for v in [100.0, 1.0, 2.0, 3.0, 4.0] {
            ring.push(v);
        }
        assert_eq!(ring.count, 4);
        assert_eq!(ring.percentile(100.0), 4.0);
    }

    #[test]
    fn counters_average_successes_only() {
        let counters = EngineCounters::default();
        counters.record_success(2_000);
        counters.record_success(4_000);
        counters.record_failure();
        let snap = counters.snapshot();
        assert_eq!(snap.total_translations, 3);
        assert_eq!(snap.failed_translations, 1);
        assert!((snap.average_processing_ms - 3.0).abs() < 1e-9);
    }
}
