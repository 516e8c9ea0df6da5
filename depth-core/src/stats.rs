//! Thread-safe windowed accumulator: per-key sample lists plus integer
//! gauges, snapshotted and reset every reporting interval (spec §4.5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub p95: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub series: HashMap<String, SeriesSummary>,
    pub gauges: HashMap<String, i64>,
    pub fps: Option<f64>,
}

struct Inner {
    series: HashMap<String, Vec<f64>>,
    gauges: HashMap<String, i64>,
    window_start: Instant,
}

pub struct StatisticsCollector {
    inner: Mutex<Inner>,
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCollector {
    pub fn new() -> Self {
        StatisticsCollector {
            inner: Mutex::new(Inner {
                series: HashMap::new(),
                gauges: HashMap::new(),
                window_start: Instant::now(),
            }),
        }
    }

    pub fn add(&self, key: &str, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.series.entry(key.to_string()).or_default().push(value);
    }

    pub fn set(&self, key: &str, value: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.gauges.insert(key.to_string(), value);
    }

    pub fn increment(&self, key: &str, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.gauges.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Summarizes every series and gauge collected since the last call,
    /// derives `fps` from the `total_s` series if present, then clears all
    /// state and restarts the window.
    pub fn snapshot_and_reset(&self) -> Snapshot {
        let mut inner = self.inner.lock().unwrap();
        let elapsed = inner.window_start.elapsed().as_secs_f64();

        let mut series = HashMap::with_capacity(inner.series.len());
        for (key, values) in inner.series.iter() {
            if values.is_empty() {
                continue;
            }
            series.insert(key.clone(), summarize(values));
        }

        let fps = series
            .get("total_s")
            .filter(|_| elapsed > 0.0)
            .map(|s| s.count as f64 / elapsed);

        let snapshot = Snapshot {
            series,
            gauges: inner.gauges.clone(),
            fps,
        };

        inner.series.clear();
        inner.gauges.clear();
        inner.window_start = Instant::now();
        snapshot
    }
}

fn summarize(values: &[f64]) -> SeriesSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let min = sorted[0];
    let max = sorted[count - 1];
    let avg = sum / count as f64;
    let p95 = percentile(&sorted, 95.0);
    SeriesSummary {
        min,
        avg,
        max,
        p95,
        count,
    }
}

/// Linear-interpolation percentile, matching `numpy.percentile`'s default
/// method closely enough for telemetry purposes.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}
