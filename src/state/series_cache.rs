use std::sync::Arc;

use dashmap::DashMap;

use crate::types::{Granularity, PriceSeries};

// ---------------------------------------------------------------------------
// SeriesCache
// ---------------------------------------------------------------------------

/// Provider responses for the current scan, keyed by `(ticker, granularity)`.
/// Cleared at the start of every scan so each scan sees fresh data.
#[derive(Default)]
pub struct SeriesCache {
    series: DashMap<(String, Granularity), Arc<PriceSeries>>,
}

impl SeriesCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, ticker: &str, granularity: Granularity) -> Option<Arc<PriceSeries>> {
        self.series
            .get(&(ticker.to_string(), granularity))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, ticker: &str, granularity: Granularity, series: PriceSeries) -> Arc<PriceSeries> {
        let series = Arc::new(series);
        self.series
            .insert((ticker.to_string(), granularity), Arc::clone(&series));
        series
    }

    pub fn clear(&self) {
        self.series.clear();
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
