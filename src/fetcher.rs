use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Months, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::latency::LatencyStats;
use crate::config::{Config, FETCH_BACKOFF_MS, FETCH_TIMEOUT_SECS};
use crate::error::{AppError, Result};
use crate::sector::Sector;
use crate::state::SeriesCache;
use crate::types::{Bar, Granularity, PriceSeries};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; retest-scanner/0.1)";
/// Tiingo has no "max" range; weekly history starts here.
const TIINGO_WEEKLY_YEARS: u32 = 40;
const DAILY_LOOKBACK_YEARS: u32 = 2;

// ---------------------------------------------------------------------------
// Fetch stats
// ---------------------------------------------------------------------------

/// Per-scan fetch counters, shared across concurrent fetches.
#[derive(Debug, Default)]
struct FetchCounters {
    requests: AtomicUsize,
    retries: AtomicUsize,
    failures: AtomicUsize,
    cache_hits: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub requests: usize,
    pub retries: usize,
    /// Fetches that still failed after the last retry.
    pub failures: usize,
    pub cache_hits: usize,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Provider {
    /// Yahoo chart API, no key.
    Yahoo { base_url: String },
    /// Tiingo end-of-day prices, adjusted fields.
    Tiingo { base_url: String, api_key: String },
}

impl Provider {
    pub fn from_config(cfg: &Config) -> Self {
        match &cfg.tiingo_api_key {
            Some(key) => Provider::Tiingo {
                base_url: cfg.tiingo_api_url.clone(),
                api_key: key.clone(),
            },
            None => Provider::Yahoo { base_url: cfg.yahoo_api_url.clone() },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Yahoo { .. } => "yahoo",
            Provider::Tiingo { .. } => "tiingo",
        }
    }
}

/// Which slice of history to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    /// Full weekly history or two years of daily bars, up to today.
    Latest,
    /// Inclusive date range, used by backtests.
    Between { start: NaiveDate, end: NaiveDate },
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Price-history client with bounded retry, a per-scan cache and latency tracking.
pub struct Fetcher {
    client: reqwest::Client,
    provider: Provider,
    /// Yahoo base URL for company profiles, whatever the price provider.
    profile_url: String,
    retries: usize,
    cache: Arc<SeriesCache>,
    /// Sectors by ticker, kept for the life of the process.
    sectors: DashMap<String, Sector>,
    latency: Arc<LatencyStats>,
    counters: FetchCounters,
}

impl Fetcher {
    pub fn new(cfg: &Config, cache: Arc<SeriesCache>, latency: Arc<LatencyStats>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            provider: Provider::from_config(cfg),
            profile_url: cfg.yahoo_api_url.clone(),
            retries: cfg.fetch_retries.min(FETCH_BACKOFF_MS.len()),
            cache,
            sectors: DashMap::new(),
            latency,
            counters: FetchCounters::default(),
        })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Drop cached series and zero the counters.
    pub fn begin_scan(&self) {
        if !self.cache.is_empty() {
            debug!("Dropping {} cached series", self.cache.len());
        }
        self.cache.clear();
        self.counters.requests.store(0, Ordering::Relaxed);
        self.counters.retries.store(0, Ordering::Relaxed);
        self.counters.failures.store(0, Ordering::Relaxed);
        self.counters.cache_hits.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Latest history for a ticker, served from the scan cache when present.
    pub async fn series(&self, ticker: &str, granularity: Granularity) -> Result<Arc<PriceSeries>> {
        if let Some(hit) = self.cache.get(ticker, granularity) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        let series = self.fetch_with_retry(ticker, granularity, FetchWindow::Latest).await?;
        Ok(self.cache.insert(ticker, granularity, series))
    }

    /// Uncached history over an explicit date range.
    pub async fn series_between(
        &self,
        ticker: &str,
        granularity: Granularity,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries> {
        self.fetch_with_retry(ticker, granularity, FetchWindow::Between { start, end })
            .await
    }

    /// Sector from the Yahoo company profile. A failed lookup is Unknown and
    /// is retried next time; a profile without a known sector is cached as Unknown.
    pub async fn sector(&self, ticker: &str) -> Sector {
        let key = ticker.to_ascii_uppercase();
        if let Some(hit) = self.sectors.get(&key) {
            return *hit;
        }
        match self.fetch_profile(&key).await {
            Ok(name) => {
                let sector = name.as_deref().map_or(Sector::Unknown, Sector::from);
                debug!(ticker = %key, sector = %sector, "Sector from profile");
                self.sectors.insert(key, sector);
                sector
            }
            Err(e) => {
                debug!(ticker = %key, "sector lookup failed: {e}");
                Sector::Unknown
            }
        }
    }

    async fn fetch_profile(&self, ticker: &str) -> Result<Option<String>> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let url = format!("{}/v10/finance/quoteSummary/{ticker}", self.profile_url);
        let resp = self
            .client
            .get(url)
            .query(&[("modules", "assetProfile")])
            .send()
            .await;
        self.latency.record(started.elapsed());
        let body: serde_json::Value = resp?.error_for_status()?.json().await?;
        parse_yahoo_profile(body)
    }

    async fn fetch_with_retry(
        &self,
        ticker: &str,
        granularity: Granularity,
        window: FetchWindow,
    ) -> Result<PriceSeries> {
        let mut attempt = 0usize;
        loop {
            match self.fetch_once(ticker, granularity, window).await {
                Ok(series) => return Ok(series),
                Err(e) if attempt < self.retries => {
                    let backoff = FETCH_BACKOFF_MS[attempt];
                    debug!(ticker, %granularity, attempt, backoff_ms = backoff, "fetch failed, retrying: {e}");
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(ticker, %granularity, provider = self.provider.name(), "fetch failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        ticker: &str,
        granularity: Granularity,
        window: FetchWindow,
    ) -> Result<PriceSeries> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let request = match &self.provider {
            Provider::Yahoo { base_url } => {
                let url = format!("{base_url}/v8/finance/chart/{ticker}");
                self.client.get(url).query(&yahoo_params(granularity, window))
            }
            Provider::Tiingo { base_url, api_key } => {
                let url = format!("{base_url}/tiingo/daily/{ticker}/prices");
                let mut params = tiingo_params(granularity, window, Utc::now().date_naive());
                params.push(("token", api_key.clone()));
                self.client.get(url).query(&params)
            }
        };

        let resp = request.send().await;
        self.latency.record(started.elapsed());
        let body: serde_json::Value = resp?.error_for_status()?.json().await?;

        let bars = match &self.provider {
            Provider::Yahoo { .. } => parse_yahoo_chart(body)?,
            Provider::Tiingo { .. } => parse_tiingo_prices(body)?,
        };
        if bars.is_empty() {
            return Err(AppError::Provider(format!("{ticker}: no {granularity} bars")));
        }
        Ok(PriceSeries::normalized(bars))
    }
}

fn yahoo_params(granularity: Granularity, window: FetchWindow) -> Vec<(&'static str, String)> {
    let interval = match granularity {
        Granularity::Weekly => "1wk",
        Granularity::Daily => "1d",
    };
    let mut params = vec![
        ("interval", interval.to_string()),
        ("events", "div,splits".to_string()),
    ];
    match window {
        FetchWindow::Latest => {
            let range = match granularity {
                Granularity::Weekly => "max",
                Granularity::Daily => "2y",
            };
            params.push(("range", range.to_string()));
        }
        FetchWindow::Between { start, end } => {
            params.push(("period1", unix_secs(start).to_string()));
            // period2 is exclusive
            params.push(("period2", (unix_secs(end) + 86_400).to_string()));
        }
    }
    params
}

fn tiingo_params(
    granularity: Granularity,
    window: FetchWindow,
    today: NaiveDate,
) -> Vec<(&'static str, String)> {
    let freq = match granularity {
        Granularity::Weekly => "weekly",
        Granularity::Daily => "daily",
    };
    let (start, end) = match window {
        FetchWindow::Latest => {
            let years = match granularity {
                Granularity::Weekly => TIINGO_WEEKLY_YEARS,
                Granularity::Daily => DAILY_LOOKBACK_YEARS,
            };
            (years_before(today, years), None)
        }
        FetchWindow::Between { start, end } => (start, Some(end)),
    };
    let mut params = vec![
        ("startDate", start.format("%Y-%m-%d").to_string()),
        ("resampleFreq", freq.to_string()),
    ];
    if let Some(end) = end {
        params.push(("endDate", end.format("%Y-%m-%d").to_string()));
    }
    params
}

fn unix_secs(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

pub fn years_before(date: NaiveDate, years: u32) -> NaiveDate {
    date.checked_sub_months(Months::new(years * 12)).unwrap_or(date)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct YahooResponse {
    chart: YahooChart,
}

#[derive(Deserialize)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooError>,
}

#[derive(Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

#[derive(Deserialize)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize)]
struct YahooIndicators {
    #[serde(default)]
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

/// Parse a v8 chart response. OHLC is rescaled by `adjclose / close` so splits
/// and dividends line up; rows with any missing field are dropped.
pub fn parse_yahoo_chart(body: serde_json::Value) -> Result<Vec<Bar>> {
    let resp: YahooResponse = serde_json::from_value(body)?;
    if let Some(err) = resp.chart.error {
        return Err(AppError::Provider(format!("{}: {}", err.code, err.description)));
    }
    let Some(result) = resp.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(AppError::Provider("chart response without result".to_string()));
    };
    let Some(quote) = result.indicators.quote.first() else {
        return Ok(Vec::new());
    };
    let adj = result.indicators.adjclose.first().map(|a| a.adjclose.as_slice());

    let field = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();
    let bars = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let date = DateTime::from_timestamp(ts, 0)?.date_naive();
            let close = field(&quote.close, i)?;
            let factor = match adj.and_then(|a| field(a, i)) {
                Some(adj_close) if close > 0.0 => adj_close / close,
                _ => 1.0,
            };
            Some(Bar {
                date,
                open: field(&quote.open, i)? * factor,
                high: field(&quote.high, i)? * factor,
                low: field(&quote.low, i)? * factor,
                close: close * factor,
                volume: field(&quote.volume, i).unwrap_or(0.0),
            })
        })
        .collect();
    Ok(bars)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct YahooProfileResponse {
    quote_summary: YahooQuoteSummary,
}

#[derive(Deserialize)]
struct YahooQuoteSummary {
    result: Option<Vec<YahooProfileResult>>,
    error: Option<YahooError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct YahooProfileResult {
    asset_profile: Option<YahooAssetProfile>,
}

#[derive(Deserialize)]
struct YahooAssetProfile {
    sector: Option<String>,
}

/// Sector name from a v10 quoteSummary `assetProfile` response. Funds and
/// ETFs have no sector; an empty name counts as none.
pub fn parse_yahoo_profile(body: serde_json::Value) -> Result<Option<String>> {
    let resp: YahooProfileResponse = serde_json::from_value(body)?;
    if let Some(err) = resp.quote_summary.error {
        return Err(AppError::Provider(format!("{}: {}", err.code, err.description)));
    }
    let sector = resp
        .quote_summary
        .result
        .and_then(|r| r.into_iter().next())
        .and_then(|r| r.asset_profile)
        .and_then(|p| p.sector)
        .filter(|s| !s.trim().is_empty());
    Ok(sector)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TiingoBar {
    date: String,
    adj_open: f64,
    adj_high: f64,
    adj_low: f64,
    adj_close: f64,
    #[serde(default)]
    adj_volume: f64,
}

/// Parse a Tiingo prices array, using the adjusted fields.
pub fn parse_tiingo_prices(body: serde_json::Value) -> Result<Vec<Bar>> {
    if let Some(detail) = body.get("detail").and_then(|d| d.as_str()) {
        return Err(AppError::Provider(detail.to_string()));
    }
    let rows: Vec<TiingoBar> = serde_json::from_value(body)?;
    rows.into_iter()
        .map(|r| {
            let day = r.date.get(..10).unwrap_or(&r.date);
            let date = NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .map_err(|e| AppError::Provider(format!("bad date {}: {e}", r.date)))?;
            Ok(Bar {
                date,
                open: r.adj_open,
                high: r.adj_high,
                low: r.adj_low,
                close: r.adj_close,
                volume: r.adj_volume,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Universe
// ---------------------------------------------------------------------------

/// Tickers from `TICKERS`, else from the `UNIVERSE_PATH` file.
pub fn load_universe(cfg: &Config) -> Result<Vec<String>> {
    if !cfg.tickers.is_empty() {
        return Ok(cfg.tickers.clone());
    }
    let Some(path) = &cfg.universe_path else {
        return Err(AppError::Config("set TICKERS or UNIVERSE_PATH".to_string()));
    };
    let raw = std::fs::read_to_string(path)?;
    let tickers = crate::config::parse_ticker_list(&raw);
    if tickers.is_empty() {
        return Err(AppError::Config(format!("universe file {path} has no tickers")));
    }
    Ok(tickers)
}

// ---------------------------------------------------------------------------
// Forward return
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardReturn {
    pub entry_date: NaiveDate,
    pub entry_close: f64,
    pub exit_date: NaiveDate,
    pub exit_close: f64,
    pub weeks: u32,
    pub return_pct: f64,
}

/// Return from the first weekly close on or after `as_of` to the bar dated
/// closest to `as_of + weeks`. `None` with fewer than two bars after `as_of`.
pub fn forward_return(weekly: &PriceSeries, as_of: NaiveDate, weeks: u32) -> Option<ForwardReturn> {
    let start = weekly.bars().partition_point(|b| b.date < as_of);
    let ahead = &weekly.bars()[start..];
    if ahead.len() < 2 {
        return None;
    }
    let entry = ahead[0];
    if entry.close <= 0.0 {
        return None;
    }
    let target = as_of + chrono::Duration::weeks(i64::from(weeks));
    let exit = ahead
        .iter()
        .min_by_key(|b| (b.date - target).num_days().abs())
        .copied()?;
    Some(ForwardReturn {
        entry_date: entry.date,
        entry_close: entry.close,
        exit_date: exit.date,
        exit_close: exit.close,
        weeks,
        return_pct: (exit.close - entry.close) / entry.close * 100.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn yahoo_chart_rescales_by_adjclose_and_skips_gaps() {
        let body = json!({
            "chart": {
                "result": [{
                    "timestamp": [1704067200, 1704672000, 1705276800],
                    "indicators": {
                        "quote": [{
                            "open":   [10.0, null, 12.0],
                            "high":   [11.0, 12.0, 13.0],
                            "low":    [9.0, 10.0, 11.0],
                            "close":  [10.0, 11.0, 12.0],
                            "volume": [100.0, 200.0, 300.0]
                        }],
                        "adjclose": [{ "adjclose": [5.0, 5.5, 6.0] }]
                    }
                }],
                "error": null
            }
        });
        let bars = parse_yahoo_chart(body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, d(2024, 1, 1));
        assert_eq!(bars[0].close, 5.0);
        assert_eq!(bars[0].high, 5.5);
        assert_eq!(bars[0].volume, 100.0);
        assert_eq!(bars[1].date, d(2024, 1, 15));
        assert_eq!(bars[1].open, 6.0);
    }

    #[test]
    fn yahoo_error_body_is_a_provider_error() {
        let body = json!({
            "chart": {
                "result": null,
                "error": { "code": "Not Found", "description": "No data found, symbol may be delisted" }
            }
        });
        assert!(matches!(parse_yahoo_chart(body), Err(AppError::Provider(_))));
    }

    #[test]
    fn yahoo_profile_yields_the_sector_name() {
        let body = json!({
            "quoteSummary": {
                "result": [{
                    "assetProfile": {
                        "industry": "Gold",
                        "sector": "Basic Materials",
                        "country": "United States"
                    }
                }],
                "error": null
            }
        });
        let name = parse_yahoo_profile(body).unwrap();
        assert_eq!(name.as_deref(), Some("Basic Materials"));
        assert_eq!(Sector::from(name.as_deref().unwrap()), Sector::Materials);

        let etf = json!({ "quoteSummary": { "result": [{ "assetProfile": { "sector": "" } }], "error": null } });
        assert_eq!(parse_yahoo_profile(etf).unwrap(), None);

        let missing = json!({
            "quoteSummary": {
                "result": null,
                "error": { "code": "Not Found", "description": "Quote not found for ticker symbol: ZZZZ" }
            }
        });
        assert!(matches!(parse_yahoo_profile(missing), Err(AppError::Provider(_))));
    }

    #[test]
    fn tiingo_uses_adjusted_fields() {
        let body = json!([
            {
                "date": "2024-01-05T00:00:00.000Z",
                "close": 100.0, "adjOpen": 48.0, "adjHigh": 51.0, "adjLow": 47.0,
                "adjClose": 50.0, "adjVolume": 1234.0
            }
        ]);
        let bars = parse_tiingo_prices(body).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].date, d(2024, 1, 5));
        assert_eq!(bars[0].close, 50.0);
        assert_eq!(bars[0].volume, 1234.0);

        let denied = json!({ "detail": "Invalid token." });
        assert!(matches!(parse_tiingo_prices(denied), Err(AppError::Provider(_))));
    }

    #[test]
    fn request_params_per_provider() {
        let yahoo = yahoo_params(Granularity::Weekly, FetchWindow::Latest);
        assert!(yahoo.contains(&("interval", "1wk".to_string())));
        assert!(yahoo.contains(&("range", "max".to_string())));

        let window = FetchWindow::Between { start: d(2020, 1, 1), end: d(2020, 1, 2) };
        let yahoo = yahoo_params(Granularity::Daily, window);
        assert!(yahoo.contains(&("period1", "1577836800".to_string())));
        assert!(yahoo.contains(&("period2", "1578009600".to_string())));

        let tiingo = tiingo_params(Granularity::Daily, FetchWindow::Latest, d(2024, 6, 30));
        assert!(tiingo.contains(&("startDate", "2022-06-30".to_string())));
        assert!(tiingo.contains(&("resampleFreq", "daily".to_string())));
        assert!(!tiingo.iter().any(|(k, _)| *k == "endDate"));
    }

    #[test]
    fn forward_return_from_first_bar_on_or_after_date() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| {
                let close = 100.0 + i as f64;
                Bar {
                    date: d(2024, 1, 1) + chrono::Duration::weeks(i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1.0,
                }
            })
            .collect();
        let weekly = PriceSeries::new(bars).unwrap();

        // Jan 3 falls between bars; entry is the Jan 8 bar (close 101)
        let fr = forward_return(&weekly, d(2024, 1, 3), 4).unwrap();
        assert_eq!(fr.entry_date, d(2024, 1, 8));
        assert_eq!(fr.entry_close, 101.0);
        // target Jan 31: Jan 29 (2 days) beats Feb 5 (5 days)
        assert_eq!(fr.exit_date, d(2024, 1, 29));
        assert_eq!(fr.exit_close, 105.0);
        assert!((fr.return_pct - 4.0 / 101.0 * 100.0).abs() < 1e-9);

        assert!(forward_return(&weekly, d(2024, 5, 13), 4).is_none());
    }
}
