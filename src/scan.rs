use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::config::{Config, Criteria, BENCHMARK_TICKER, MIN_WEEKLY_BARS, SECTOR_RETURN_WEEKS};
use crate::db::queries::insert_scan;
use crate::error::{EvalError, Result};
use crate::evaluator::{evaluate, TickerContext};
use crate::fetcher::{load_universe, Fetcher};
use crate::sector::{relative_return, Sector, SectorBook};
use crate::types::{
    CompletedScan, Granularity, PriceSeries, ScanEvent, ScanSummary, ScoreCategory, ScoredResult,
    SkipReason,
};

/// What happened to one ticker.
#[derive(Debug)]
enum TickerOutcome {
    Evaluated(Box<ScoredResult>),
    Skipped {
        ticker: String,
        reason: SkipReason,
        detail: String,
    },
}

impl ScanSummary {
    /// Count an evaluated ticker. Returns true when it is a hit.
    pub fn record_evaluated(&mut self, result: &ScoredResult, min_display_score: f64) -> bool {
        self.evaluated += 1;
        if result.daily.is_none() {
            self.daily_missing += 1;
        }
        match result.category {
            ScoreCategory::FullHit => self.full_hits += 1,
            ScoreCategory::Strong => self.strong += 1,
            ScoreCategory::Watchlist => self.watchlist += 1,
        }
        let hit = result.normalized_score >= min_display_score;
        if hit {
            self.hits += 1;
        } else {
            self.below_threshold += 1;
        }
        hit
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoData => self.skipped_no_data += 1,
            SkipReason::ShortHistory => self.skipped_short_history += 1,
            SkipReason::PriceFloor => self.skipped_price_floor += 1,
        }
    }
}

/// Runs scans on a schedule and on demand. One scan at a time.
pub struct Scanner {
    cfg: Config,
    fetcher: Arc<Fetcher>,
    pool: sqlx::SqlitePool,
    sectors: SectorBook,
    health: Arc<HealthState>,
    trigger_rx: mpsc::Receiver<()>,
    event_tx: mpsc::Sender<ScanEvent>,
    writer_tx: mpsc::Sender<CompletedScan>,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        fetcher: Arc<Fetcher>,
        pool: sqlx::SqlitePool,
        sectors: SectorBook,
        health: Arc<HealthState>,
        trigger_rx: mpsc::Receiver<()>,
        event_tx: mpsc::Sender<ScanEvent>,
        writer_tx: mpsc::Sender<CompletedScan>,
    ) -> Self {
        Self { cfg, fetcher, pool, sectors, health, trigger_rx, event_tx, writer_tx }
    }

    pub async fn run(mut self) {
        // first tick fires immediately: scan once at startup
        let mut ticker = interval(Duration::from_secs(self.cfg.scan_interval_secs.max(60)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = self.trigger_rx.recv() => {
                    info!("On-demand scan requested");
                }
            }
            if let Err(e) = self.scan().await {
                error!("Scan failed: {e}");
            }
        }
    }

    async fn scan(&mut self) -> Result<()> {
        let universe = load_universe(&self.cfg)?;
        if !self.health.try_start_scan(universe.len() as u64) {
            warn!("Scan already running, request ignored");
            return Ok(());
        }

        match self.run_scan(universe).await {
            Ok(completed) => {
                let finished_at = completed.summary.finished_at.unwrap_or_else(now_secs);
                self.health.inc_write_queue_pending();
                if let Err(e) = self.writer_tx.send(completed).await {
                    self.health.dec_write_queue_pending();
                    error!("Result writer channel closed: {e}");
                }
                self.health.finish_scan(finished_at);
                Ok(())
            }
            Err(e) => {
                self.health.abort_scan();
                Err(e)
            }
        }
    }

    async fn run_scan(&mut self, universe: Vec<String>) -> Result<CompletedScan> {
        let criteria = &self.cfg.criteria;
        let started_at = now_secs();
        let scan_id = insert_scan(&self.pool, criteria.mode, started_at, universe.len()).await?;

        self.fetcher.begin_scan();
        self.emit(ScanEvent::Started { scan_id, universe: universe.len(), mode: criteria.mode });

        let relative = self.sector_returns().await;
        self.sectors.set_relative_returns(relative);

        let mut summary = ScanSummary {
            scan_id,
            mode: Some(self.cfg.criteria.mode),
            started_at,
            universe: universe.len(),
            ..ScanSummary::default()
        };
        let total = universe.len();
        let mut results: Vec<ScoredResult> = Vec::new();

        let this = &*self;
        let mut outcomes = stream::iter(universe)
            .map(|ticker| this.scan_ticker(ticker))
            .buffer_unordered(this.cfg.scan_concurrency);

        let mut done = 0usize;
        while let Some(outcome) = outcomes.next().await {
            done += 1;
            this.health.inc_scan_progress();
            match outcome {
                TickerOutcome::Evaluated(result) => {
                    let hit = summary.record_evaluated(&result, this.cfg.criteria.min_display_score);
                    results.push((*result).clone());
                    this.emit(ScanEvent::Evaluated { done, total, result, hit });
                }
                TickerOutcome::Skipped { ticker, reason, detail } => {
                    summary.record_skip(reason);
                    this.emit(ScanEvent::Skipped { done, total, ticker, reason, detail });
                }
            }
        }

        summary.finished_at = Some(now_secs());
        let fetch = this.fetcher.stats();
        info!(
            scan_id,
            requests = fetch.requests,
            retries = fetch.retries,
            failures = fetch.failures,
            cache_hits = fetch.cache_hits,
            "Fetch stats: {} requests, {} retries, {} failures",
            fetch.requests,
            fetch.retries,
            fetch.failures,
        );
        this.emit(ScanEvent::Finished(summary.clone()));

        Ok(CompletedScan { summary, results })
    }

    /// 26-week return of each sector ETF relative to the benchmark. Sectors whose
    /// ETF fails to load are left out and earn no sector points.
    async fn sector_returns(&self) -> HashMap<Sector, f64> {
        let benchmark = match self.fetcher.series(BENCHMARK_TICKER, Granularity::Weekly).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Benchmark {BENCHMARK_TICKER} unavailable, sector points disabled: {e}");
                return HashMap::new();
            }
        };

        let fetches = Sector::TRACKED.into_iter().filter_map(|sector| {
            let etf = sector.etf()?;
            Some(async move { (sector, self.fetcher.series(etf, Granularity::Weekly).await) })
        });
        let loaded: Vec<_> = stream::iter(fetches)
            .buffer_unordered(self.cfg.scan_concurrency)
            .collect()
            .await;

        let mut relative = HashMap::new();
        for (sector, series) in loaded {
            match series {
                Ok(etf) => {
                    let rel = relative_return(&etf, &benchmark, SECTOR_RETURN_WEEKS);
                    debug!(sector = %sector, relative_pct = rel, "Sector momentum");
                    relative.insert(sector, rel);
                }
                Err(e) => warn!(sector = %sector, "Sector ETF unavailable: {e}"),
            }
        }
        relative
    }

    async fn scan_ticker(&self, ticker: String) -> TickerOutcome {
        let skip = |reason, detail: String| TickerOutcome::Skipped {
            ticker: ticker.clone(),
            reason,
            detail,
        };

        let weekly = match self.fetcher.series(&ticker, Granularity::Weekly).await {
            Ok(s) => s,
            Err(e) => return skip(SkipReason::NoData, e.to_string()),
        };
        if let Some((reason, detail)) = screen_weekly(&weekly, self.cfg.criteria.min_price) {
            return skip(reason, detail);
        }

        // no daily data is scored without daily points
        let daily = match self.fetcher.series(&ticker, Granularity::Daily).await {
            Ok(s) => s,
            Err(_) => Arc::new(PriceSeries::default()),
        };

        let sector = self.sectors.resolve(&self.fetcher, &ticker).await;
        let ctx = self.sectors.context_for(&ticker, sector);
        evaluate_ticker(&ticker, &weekly, &daily, &self.cfg.criteria, &ctx)
    }

    fn emit(&self, event: ScanEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Scan event channel full: {e}");
        }
    }
}

/// Weekly floors checked before the daily series is fetched.
fn screen_weekly(weekly: &PriceSeries, min_price: f64) -> Option<(SkipReason, String)> {
    if weekly.len() < MIN_WEEKLY_BARS {
        return Some((
            SkipReason::ShortHistory,
            format!("{} weekly bars, need {MIN_WEEKLY_BARS}", weekly.len()),
        ));
    }
    let close = weekly.last().map_or(0.0, |b| b.close);
    if close < min_price {
        return Some((SkipReason::PriceFloor, format!("close {close:.2} below {min_price:.2}")));
    }
    None
}

fn evaluate_ticker(
    ticker: &str,
    weekly: &PriceSeries,
    daily: &PriceSeries,
    criteria: &Criteria,
    ctx: &TickerContext,
) -> TickerOutcome {
    match evaluate(ticker, weekly, daily, criteria, ctx) {
        Ok(result) => TickerOutcome::Evaluated(Box::new(result)),
        Err(e @ EvalError::InsufficientHistory { .. }) => TickerOutcome::Skipped {
            ticker: ticker.to_string(),
            reason: SkipReason::ShortHistory,
            detail: e.to_string(),
        },
    }
}

/// Consumes scan progress: logs hits and skips, reports the final tally.
pub async fn scan_event_consumer(mut rx: mpsc::Receiver<ScanEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            ScanEvent::Started { scan_id, universe, mode } => {
                info!(
                    event = "SCAN_STARTED",
                    scan_id,
                    universe,
                    mode = %mode,
                    "SCAN STARTED | id: {scan_id} | mode: {mode} | tickers: {universe}",
                );
            }
            ScanEvent::Evaluated { done, total, result, hit } => log_evaluated(*done, *total, result, *hit),
            ScanEvent::Skipped { done, total, ticker, reason, detail } => {
                debug!(
                    event = "SKIPPED",
                    ticker = %ticker,
                    reason = %reason,
                    "[{done}/{total}] {ticker} skipped ({reason}): {detail}",
                );
            }
            ScanEvent::Finished(s) => {
                info!(
                    event = "SCAN_FINISHED",
                    scan_id = s.scan_id,
                    evaluated = s.evaluated,
                    hits = s.hits,
                    skipped = s.skipped(),
                    "SCAN FINISHED | evaluated: {} | hits: {} (full {} / strong {}) | below: {} | skipped: no_data {} short {} price {} | daily missing: {}",
                    s.evaluated,
                    s.hits,
                    s.full_hits,
                    s.strong,
                    s.below_threshold,
                    s.skipped_no_data,
                    s.skipped_short_history,
                    s.skipped_price_floor,
                    s.daily_missing,
                );
            }
        }
    }
}

fn log_evaluated(done: usize, total: usize, r: &ScoredResult, hit: bool) {
    if hit {
        info!(
            event = "HIT",
            ticker = %r.ticker,
            score = r.normalized_score,
            category = %r.category,
            sector = %r.sector.name,
            "[{done}/{total}] HIT {} | score: {:.0} | {} | {} | {}",
            r.ticker,
            r.normalized_score,
            r.category,
            r.structure.label,
            r.signal_summary,
        );
    } else {
        debug!(
            ticker = %r.ticker,
            score = r.normalized_score,
            "[{done}/{total}] {} scored {:.0}",
            r.ticker,
            r.normalized_score,
        );
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::test_support::result;
    use crate::evaluator::test_support::{daily_bars, series_from, weekly_bars};

    #[test]
    fn summary_counts_hits_categories_and_skips() {
        let mut s = ScanSummary::default();
        assert!(s.record_evaluated(&result("A", 85.0), 60.0));
        assert!(s.record_evaluated(&result("B", 60.0), 60.0));
        assert!(!s.record_evaluated(&result("C", 59.0), 60.0));

        let mut no_daily = result("D", 10.0);
        no_daily.daily = None;
        assert!(!s.record_evaluated(&no_daily, 60.0));

        s.record_skip(SkipReason::NoData);
        s.record_skip(SkipReason::PriceFloor);
        s.record_skip(SkipReason::PriceFloor);

        assert_eq!(s.evaluated, 4);
        assert_eq!(s.hits, 2);
        assert_eq!(s.below_threshold, 2);
        assert_eq!((s.full_hits, s.strong, s.watchlist), (1, 1, 2));
        assert_eq!(s.daily_missing, 1);
        assert_eq!(s.skipped(), 3);
        assert_eq!(s.skipped_price_floor, 2);
    }

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 50.0 + i as f64 * 0.5).collect()
    }

    #[test]
    fn sixty_weekly_bars_are_evaluated_not_skipped() {
        let weekly = series_from(weekly_bars(&rising(60), &vec![1000.0; 60]));
        let daily = series_from(daily_bars(&rising(120), &vec![1000.0; 120]));
        let criteria = Criteria::default();

        assert!(screen_weekly(&weekly, criteria.min_price).is_none());
        let outcome = evaluate_ticker("NEWCO", &weekly, &daily, &criteria, &TickerContext::default());

        let mut s = ScanSummary::default();
        match outcome {
            TickerOutcome::Evaluated(r) => {
                s.record_evaluated(&r, criteria.min_display_score);
            }
            TickerOutcome::Skipped { reason, .. } => s.record_skip(reason),
        }
        assert_eq!(s.evaluated, 1);
        assert_eq!(s.skipped_short_history, 0);
    }

    #[test]
    fn weekly_floors_skip_short_and_cheap_tickers() {
        let short = series_from(weekly_bars(&rising(51), &vec![1000.0; 51]));
        let (reason, detail) = screen_weekly(&short, 5.0).unwrap();
        assert_eq!(reason, SkipReason::ShortHistory);
        assert!(detail.contains("51 weekly bars"));

        let cheap = series_from(weekly_bars(&vec![3.0; 60], &vec![1000.0; 60]));
        assert_eq!(screen_weekly(&cheap, 5.0).unwrap().0, SkipReason::PriceFloor);
    }
}
