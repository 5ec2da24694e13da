use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the server.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "connections_active";
    pub const CONNECTIONS_TOTAL: &str = "connections_total";
    pub const TURNS_STARTED: &str = "turns_started";
    pub const TURNS_COMPLETED: &str = "turns_completed";
    pub const TURNS_INTERRUPTED: &str = "turns_interrupted";
    pub const TURNS_OVERLOADED: &str = "turns_overloaded";
    pub const TURNS_FAILED: &str = "turns_failed";
    pub const MESSAGES_SENT: &str = "messages_sent";
    pub const TOOL_PAIRS_SYNTHESIZED: &str = "tool_pairs_synthesized";
    pub const TRANSPORT_ERRORS: &str = "transport_errors";
    pub const TURN_DURATION_MS: &str = "turn_duration_ms";
}

/// Observations kept per histogram; older ones are discarded.
const HISTOGRAM_WINDOW: usize = 1024;

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

struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Sliding-window histogram over the most recent observations.
struct Histogram {
    observations: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::with_capacity(HISTOGRAM_WINDOW)),
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
        let mut obs: Vec<f64> = self.observations.lock().iter().copied().collect();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        HistogramSummary {
            count: count as u64,
            sum,
            p50: obs[count / 2],
            p95: obs[((count as f64 * 0.95) as usize).min(count - 1)],
            max: obs[count - 1],
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Point-in-time view of every metric, as reported by `/health`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, n: u64) {
        let counters = self.counters.read();
        if let Some(c) = counters.get(name) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .increment(n);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_add(&self, name: &str, delta: i64) {
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(name) {
            g.add(delta);
            return;
        }
        drop(gauges);
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .add(delta);
    }

    pub fn histogram_observe(&self, name: &str, value: f64) {
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(name) {
            h.observe(value);
            return;
        }
        drop(histograms);
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters.read().get(name).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str) -> i64 {
        self.gauges.read().get(name).map_or(0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str) -> HistogramSummary {
        self.histograms
            .read()
            .get(name)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, c)| (k.clone(), c.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, g)| (k.clone(), g.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, h)| (k.clone(), h.summary()))
                .collect(),
        }
    }
}
