use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are evicted first.
const HISTOGRAM_WINDOW: usize = 4096;

/// Type of metric.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Can go up or down. Stored as f64 bits.
struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }
    fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Sliding window of recent observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.pop_front();
        }
        obs.push_back(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.observations.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: sorted.iter().sum(),
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.increment(n);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .increment(n);
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.set(value);
            return;
        }
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.increment(delta);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(Gauge::new)
            .increment(delta);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    /// Every current series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Counter,
                value: counter.get() as f64,
                summary: None,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Gauge,
                value: gauge.get(),
                summary: None,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Histogram,
                value: summary.count as f64,
                summary: Some(summary),
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("events_total", &[("event", "user:create")], 1);
        recorder.counter_inc("events_total", &[("event", "user:create")], 1);
        recorder.counter_inc("events_total", &[("event", "user:list")], 1);

        assert_eq!(recorder.counter_get("events_total", &[("event", "user:create")]), 2);
        assert_eq!(recorder.counter_get("events_total", &[("event", "user:list")]), 1);
        assert_eq!(recorder.counter_get("events_total", &[("event", "message:send")]), 0);
    }

    #[test]
    fn gauge_set_and_increment() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("connections_active", &[], 10.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 10.0);

        recorder.gauge_inc("connections_active", &[], 5.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 15.0);

        recorder.gauge_inc("connections_active", &[], -3.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 12.0);
    }

    #[test]
    fn gauge_goes_negative() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("g", &[], -2.5);
        assert_eq!(recorder.gauge_get("g", &[]), -2.5);
    }

    #[test]
    fn histogram_observations() {
        let recorder = MetricsRecorder::new();
        let labels = &[("event", "user:create")];

        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            recorder.histogram_observe("handler_duration_ms", labels, v);
        }

        let summary = recorder.histogram_summary("handler_duration_ms", labels);
        assert_eq!(summary.count, 10);
        assert_eq!(summary.sum, 550.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 60.0);
        assert!(summary.p95 >= 90.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for i in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], i as f64);
        }
        assert_eq!(recorder.histogram_summary("h", &[]).count, HISTOGRAM_WINDOW as u64);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        let summary = recorder.histogram_summary("nonexistent", &[]);
        assert_eq!(summary, HistogramSummary::default());
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);

        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_lists_every_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("events_total", &[("event", "x")], 3);
        recorder.gauge_set("connections_active", &[], 2.0);
        recorder.histogram_observe("handler_duration_ms", &[], 1.5);

        let snapshot = recorder.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["connections_active", "events_total", "handler_duration_ms"]);
        assert_eq!(snapshot[1].value, 3.0);
        assert_eq!(snapshot[1].metric_type, MetricType::Counter);
        assert!(snapshot[2].summary.is_some());
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let r = recorder.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    r.counter_inc("concurrent", &[], 1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(recorder.counter_get("concurrent", &[]), 10_000);
    }
}
