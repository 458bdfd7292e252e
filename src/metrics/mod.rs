//! Prometheus-style metrics for the proxy.
//!
//! Counters, gauges and histograms over atomics; labeled variants keep one
//! atomic cell per label set behind a read-mostly lock. The request-lifecycle
//! engine records into [`ProxyMetrics`]; the binary can dump a text snapshot
//! on the stats listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

/// Latency buckets for proxy-observed request time (seconds).
pub const REQUEST_TIME_BUCKETS: &[f64] = &[
    0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// An up-down gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter with `N` label dimensions.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    cells: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, labels: [&str; N]) {
        {
            let cells = self.cells.read();
            if let Some(cell) = cells.get(&labels.map(str::to_string)) {
                cell.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut cells = self.cells.write();
        cells
            .entry(labels.map(str::to_string))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, labels: [&str; N]) -> u64 {
        self.cells
            .read()
            .get(&labels.map(str::to_string))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        for (labels, cell) in self.cells.read().iter() {
            out.push_str(&format!(
                "{}{{{}}} {}\n",
                self.name,
                labels.join(","),
                cell.load(Ordering::Relaxed)
            ));
        }
    }
}

/// A gauge with `N` label dimensions.
#[derive(Debug)]
pub struct LabeledGauge<const N: usize> {
    name: &'static str,
    cells: RwLock<HashMap<[String; N], AtomicI64>>,
}

impl<const N: usize> LabeledGauge<N> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cells: RwLock::new(HashMap::new()),
        }
    }

    fn cell(&self, labels: [&str; N], delta: i64) {
        {
            let cells = self.cells.read();
            if let Some(cell) = cells.get(&labels.map(str::to_string)) {
                cell.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }
        let mut cells = self.cells.write();
        cells
            .entry(labels.map(str::to_string))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc(&self, labels: [&str; N]) {
        self.cell(labels, 1);
    }

    pub fn dec(&self, labels: [&str; N]) {
        self.cell(labels, -1);
    }

    pub fn get(&self, labels: [&str; N]) -> i64 {
        self.cells
            .read()
            .get(&labels.map(str::to_string))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        for (labels, cell) in self.cells.read().iter() {
            out.push_str(&format!(
                "{}{{{}}} {}\n",
                self.name,
                labels.join(","),
                cell.load(Ordering::Relaxed)
            ));
        }
    }
}

/// Cumulative histogram cell.
#[derive(Debug)]
struct HistogramCell {
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl HistogramCell {
    fn new(n: usize) -> Self {
        Self {
            buckets: (0..n).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, bounds: &[f64], dur: Duration) {
        let secs = dur.as_secs_f64();
        for (i, &bound) in bounds.iter().enumerate() {
            if secs <= bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add(dur.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A duration histogram with `N` label dimensions.
#[derive(Debug)]
pub struct LabeledHistogram<const N: usize> {
    name: &'static str,
    bounds: &'static [f64],
    cells: RwLock<HashMap<[String; N], HistogramCell>>,
}

impl<const N: usize> LabeledHistogram<N> {
    pub fn new(name: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            bounds,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, labels: [&str; N], dur: Duration) {
        {
            let cells = self.cells.read();
            if let Some(cell) = cells.get(&labels.map(str::to_string)) {
                cell.observe(self.bounds, dur);
                return;
            }
        }
        let mut cells = self.cells.write();
        cells
            .entry(labels.map(str::to_string))
            .or_insert_with(|| HistogramCell::new(self.bounds.len()))
            .observe(self.bounds, dur);
    }

    pub fn count(&self, labels: [&str; N]) -> u64 {
        self.cells
            .read()
            .get(&labels.map(str::to_string))
            .map(|c| c.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        for (labels, cell) in self.cells.read().iter() {
            out.push_str(&format!(
                "{}_count{{{}}} {}\n{}_sum_us{{{}}} {}\n",
                self.name,
                labels.join(","),
                cell.count.load(Ordering::Relaxed),
                self.name,
                labels.join(","),
                cell.sum_micros.load(Ordering::Relaxed),
            ));
        }
    }
}

/// All metrics the request-lifecycle engine emits.
#[derive(Debug)]
pub struct ProxyMetrics {
    /// Open client connections per cluster.
    pub conns: LabeledGauge<1>,
    /// Client-observed request time per (cluster, command).
    pub proxy_time: LabeledHistogram<2>,
    /// Backend round-trip time per (cluster, backend, command).
    pub handle_time: LabeledHistogram<3>,
    /// Errors per (cluster, backend, command, cause).
    pub errors: LabeledCounter<4>,
    /// Retrieval hits per (cluster, backend).
    pub hits: LabeledCounter<2>,
    /// Retrieval misses per (cluster, backend).
    pub misses: LabeledCounter<2>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            conns: LabeledGauge::new("porter_connections"),
            proxy_time: LabeledHistogram::new("porter_proxy_time", REQUEST_TIME_BUCKETS),
            handle_time: LabeledHistogram::new("porter_handle_time", REQUEST_TIME_BUCKETS),
            errors: LabeledCounter::new("porter_errors_total"),
            hits: LabeledCounter::new("porter_hits_total"),
            misses: LabeledCounter::new("porter_misses_total"),
        }
    }

    /// Plain-text snapshot of every metric.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.conns.render(&mut out);
        self.proxy_time.render(&mut out);
        self.handle_time.render(&mut out);
        self.errors.render(&mut out);
        self.hits.render(&mut out);
        self.misses.render(&mut out);
        out
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(-3);
        assert_eq!(g.get(), -3);
    }

    #[test]
    fn test_labeled_counter() {
        let c = LabeledCounter::<2>::new("test_total");
        c.inc(["alpha", "get"]);
        c.inc(["alpha", "get"]);
        c.inc(["beta", "set"]);
        assert_eq!(c.get(["alpha", "get"]), 2);
        assert_eq!(c.get(["beta", "set"]), 1);
        assert_eq!(c.get(["beta", "get"]), 0);
    }

    #[test]
    fn test_labeled_histogram() {
        let h = LabeledHistogram::<2>::new("test_time", REQUEST_TIME_BUCKETS);
        h.observe(["alpha", "get"], Duration::from_micros(200));
        h.observe(["alpha", "get"], Duration::from_millis(2));
        assert_eq!(h.count(["alpha", "get"]), 2);
    }

    #[test]
    fn test_render_snapshot() {
        let m = ProxyMetrics::new();
        m.conns.inc(["alpha"]);
        m.hits.inc(["alpha", "127.0.0.1:11211"]);
        let text = m.render();
        assert!(text.contains("porter_connections{alpha} 1"));
        assert!(text.contains("porter_hits_total{alpha,127.0.0.1:11211} 1"));
    }
}
