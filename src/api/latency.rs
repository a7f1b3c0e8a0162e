//! In-memory latency histogram for price-history requests.
//! The fetcher records one sample per HTTP attempt, retries included.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Shared fetch latency stats. Fetcher records, API reads.
/// Values stored in microseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

/// Snapshot served by `/stats/latency`, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

impl LatencyStats {
    /// Tracks 1us to 100s, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record_us(&self, us: u64) {
        if let Ok(mut h) = self.inner.lock() {
            // values above the upper bound are clamped rather than dropped
            h.saturating_record(us.max(1));
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        self.record_us(us);
    }

    /// Return (p50_us, p95_us, p99_us). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        let p50 = h.value_at_quantile(0.5);
        let p95 = h.value_at_quantile(0.95);
        let p99 = h.value_at_quantile(0.99);
        (Some(p50), Some(p95), Some(p99))
    }

    pub fn summary(&self) -> LatencySummary {
        let (p50, p95, p99) = self.percentiles();
        let max = self
            .inner
            .lock()
            .ok()
            .filter(|h| h.len() > 0)
            .map(|h| h.max());
        let ms = |us: Option<u64>| us.map(|v| (v as f64 / 1000.0 * 10.0).round() / 10.0);
        LatencySummary {
            samples: self.len(),
            p50_ms: ms(p50),
            p95_ms: ms(p95),
            p99_ms: ms(p99),
            max_ms: ms(max),
        }
    }

    /// Sample count.
    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Drop all samples, e.g. at the start of a scan.
    pub fn reset(&self) {
        if let Ok(mut h) = self.inner.lock() {
            h.reset();
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
