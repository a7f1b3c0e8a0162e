use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::types::ScanMode;

pub const YAHOO_API_URL: &str = "https://query1.finance.yahoo.com";
pub const TIINGO_API_URL: &str = "https://api.tiingo.com";

/// Channel capacity for scan progress and result routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Per-request HTTP timeout for price history. A timeout is a fetch failure.
pub const FETCH_TIMEOUT_SECS: u64 = 20;

/// Retry backoff values in milliseconds. Length bounds the retry count.
pub const FETCH_BACKOFF_MS: &[u64] = &[250, 500, 1000, 2000];

/// Evaluator floors. Below these the evaluators return the insufficient-history error.
pub const MIN_WEEKLY_BARS: usize = 52;
pub const MIN_DAILY_BARS: usize = 55;

/// Sector momentum: ETF return over this many weekly bars, minus the benchmark's.
pub const SECTOR_RETURN_WEEKS: usize = 26;
pub const BENCHMARK_TICKER: &str = "SPY";

/// Lookback for `/backtest` history when evaluating as of a past date.
pub const BACKTEST_WEEKLY_YEARS: u32 = 10;
pub const BACKTEST_DAILY_YEARS: u32 = 2;

/// Fixed rule constants shared by the evaluators.
pub mod thresholds {
    /// Bars excluded from the end when locating the window high and low.
    pub const ATH_EXCLUDE_BARS: usize = 8;
    pub const SLOPE_RISING_MIN: f64 = 0.10;
    pub const SLOPE_DECLINING_MAX: f64 = -0.10;
    pub const SLOPE_ACCEL_ESCAPE: f64 = 0.05;
    pub const UNDERCUT_LOOKBACK: usize = 8;
    pub const MULTIYEAR_VOL_LOOKBACK: usize = 156;
    pub const MULTIYEAR_VOL_RATIO: f64 = 0.95;
    pub const RESISTANCE_FLIP_MAX_PCT: f64 = 3.0;

    pub const DOT_ATR_MULT: f64 = -10.0;
    pub const DOT_LOOKBACK: usize = 60;
    pub const BREAKOUT_BUFFER: f64 = 1.005;
    pub const BREAKOUT_VOL_MULT: f64 = 1.5;
    pub const RECLAIM_VOL_MULT: f64 = 1.2;
    pub const BASING_ATR_CONTRACTION: f64 = 0.80;
    pub const BASING_RANGE_MAX_PCT: f64 = 4.0;
    pub const BASING_VOL_DRY: f64 = 0.80;
    pub const P50_FLOOR: f64 = -40.0;
    pub const EMA_SPREAD_MIN: f64 = -5.0;
    pub const CANDLE_POSITION_MIN: f64 = 0.4;

    pub const BASE_MIN_WINDOW: usize = 26;
    pub const BASE_DURATION_BAND_LO: f64 = 0.85;
    pub const BASE_DURATION_BAND_HI: f64 = 1.15;
    pub const BASE_SLOPE_MIN: f64 = -0.05;
    pub const GROWTH_DIST_MIN: f64 = 50.0;
    pub const GROWTH_MAX_DURATION: usize = 130;
    pub const GROWTH_MIN_DURATION: usize = 52;

    /// Category cut-offs as a percentage of the normalized score.
    pub const FULL_HIT_PCT: f64 = 80.0;
    pub const STRONG_PCT: f64 = 60.0;
}

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklyCriteria {
    /// Max % below the 200W SMA (W_DIST_BELOW)
    pub dist_below_pct: f64,
    /// Max % above the 200W SMA (W_DIST_ABOVE)
    pub dist_above_pct: f64,
    /// Prior run floor, before the sector-aware cap (W_PRIOR_RUN)
    pub prior_run_min: f64,
    /// W_CORRECTION
    pub correction_min: f64,
    /// W_VOL_MULT
    pub vol_multiple: f64,
}

impl Default for WeeklyCriteria {
    fn default() -> Self {
        Self {
            dist_below_pct: 60.0,
            dist_above_pct: 80.0,
            prior_run_min: 300.0,
            correction_min: 35.0,
            vol_multiple: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCriteria {
    pub atr_min_pct: f64,
    pub atr_max_pct: f64,
    /// Max % above the 50-day SMA (D_ABOVE_50SMA)
    pub above_50sma_max: f64,
}

impl Default for DailyCriteria {
    fn default() -> Self {
        Self {
            atr_min_pct: 3.0,
            atr_max_pct: 12.0,
            above_50sma_max: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseCriteria {
    pub base_years: f64,
    pub range_max_pct: f64,
    pub atr_max_pct: f64,
    pub vol_multiple: f64,
    pub sma_lo_pct: f64,
    pub sma_hi_pct: f64,
}

impl Default for BaseCriteria {
    fn default() -> Self {
        Self {
            base_years: 2.0,
            range_max_pct: 60.0,
            atr_max_pct: 4.0,
            vol_multiple: 2.0,
            sma_lo_pct: 10.0,
            sma_hi_pct: 40.0,
        }
    }
}

impl BaseCriteria {
    pub fn base_weeks(&self) -> usize {
        (self.base_years * 52.0).round().max(0.0) as usize
    }
}

// ---------------------------------------------------------------------------
// Scoring weights
// ---------------------------------------------------------------------------

/// A proportional sub-score: 0 at `floor`, `max` at `cap`, linear between.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlidingScale {
    pub floor: f64,
    pub cap: f64,
    pub max: f64,
}

impl SlidingScale {
    pub fn points(&self, value: f64) -> f64 {
        if self.cap <= self.floor {
            return 0.0;
        }
        ((value - self.floor) / (self.cap - self.floor) * self.max).clamp(0.0, self.max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupWeights {
    pub prior_run: SlidingScale,
    pub correction: SlidingScale,
    pub volume: SlidingScale,
    pub proximity: f64,
    pub proximity_near: f64,
    pub proximity_near_pct: f64,
    pub slope_rising: f64,
    pub slope_flattening: f64,
}

impl Default for SetupWeights {
    fn default() -> Self {
        Self {
            prior_run: SlidingScale { floor: 100.0, cap: 1000.0, max: 25.0 },
            correction: SlidingScale { floor: 20.0, cap: 80.0, max: 20.0 },
            volume: SlidingScale { floor: 1.0, cap: 3.0, max: 20.0 },
            proximity: 15.0,
            proximity_near: 5.0,
            proximity_near_pct: 10.0,
            slope_rising: 8.0,
            slope_flattening: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyGateWeights {
    pub atr: f64,
    pub sma50: f64,
    pub ema_cross: f64,
    pub candle: f64,
}

impl Default for DailyGateWeights {
    fn default() -> Self {
        Self { atr: 5.0, sma50: 5.0, ema_cross: 3.0, candle: 2.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusWeights {
    pub resistance_flip: f64,
    pub undercut_recent: f64,
    pub undercut_older: f64,
    /// Undercut-and-reclaim at most this many weeks ago earns the recent weight.
    pub undercut_recent_weeks: usize,
    pub multiyear_volume: f64,
}

impl Default for BonusWeights {
    fn default() -> Self {
        Self {
            resistance_flip: 5.0,
            undercut_recent: 8.0,
            undercut_older: 4.0,
            undercut_recent_weeks: 4,
            multiyear_volume: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructurePoints {
    pub full_stack: i32,
    pub partial_stack: i32,
    pub ema_bounce: i32,
    pub first_pullback: i32,
    pub first_pullback_loose: i32,
}

impl Default for StructurePoints {
    fn default() -> Self {
        Self {
            full_stack: 15,
            partial_stack: 8,
            ema_bounce: 10,
            first_pullback: 10,
            first_pullback_loose: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionPoints {
    pub breakout: i32,
    pub ma_reclaim: i32,
    pub basing: i32,
    pub basing_dry_volume: i32,
}

impl Default for ExhaustionPoints {
    fn default() -> Self {
        Self { breakout: 12, ma_reclaim: 8, basing: 8, basing_dry_volume: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorPoints {
    pub strong_min_pct: f64,
    pub strong: i32,
    pub positive_min_pct: f64,
    pub positive: i32,
    pub neutral_min_pct: f64,
    pub lagging: i32,
}

impl Default for SectorPoints {
    fn default() -> Self {
        Self {
            strong_min_pct: 15.0,
            strong: 10,
            positive_min_pct: 5.0,
            positive: 5,
            neutral_min_pct: -5.0,
            lagging: -5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseWeights {
    pub sma_proximity: f64,
    pub range: f64,
    pub atr: f64,
    pub volume: f64,
    pub duration: f64,
    pub slope: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub setup: SetupWeights,
    pub daily: DailyGateWeights,
    pub bonus: BonusWeights,
    pub structure: StructurePoints,
    pub exhaustion: ExhaustionPoints,
    pub sector: SectorPoints,
    pub growth_base: BaseWeights,
    pub commodity_base: BaseWeights,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            setup: SetupWeights::default(),
            daily: DailyGateWeights::default(),
            bonus: BonusWeights::default(),
            structure: StructurePoints::default(),
            exhaustion: ExhaustionPoints::default(),
            sector: SectorPoints::default(),
            growth_base: BaseWeights {
                sma_proximity: 15.0,
                range: 20.0,
                atr: 15.0,
                volume: 25.0,
                duration: 10.0,
                slope: 5.0,
            },
            commodity_base: BaseWeights {
                sma_proximity: 25.0,
                range: 20.0,
                atr: 20.0,
                volume: 20.0,
                duration: 10.0,
                slope: 5.0,
            },
        }
    }
}

impl ScoringWeights {
    /// Load from a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Everything the pure evaluation path needs.
#[derive(Debug, Clone)]
pub struct Criteria {
    pub mode: ScanMode,
    pub weekly: WeeklyCriteria,
    pub daily: DailyCriteria,
    pub base: BaseCriteria,
    pub weights: ScoringWeights,
    /// Raw points that map to a normalized 100.
    pub score_scale: f64,
    /// Results below this normalized score are not hits.
    pub min_display_score: f64,
    pub min_price: f64,
}

impl Default for Criteria {
    fn default() -> Self {
        Self {
            mode: ScanMode::Retest,
            weekly: WeeklyCriteria::default(),
            daily: DailyCriteria::default(),
            base: BaseCriteria::default(),
            weights: ScoringWeights::default(),
            score_scale: 125.0,
            min_display_score: 60.0,
            min_price: 5.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub yahoo_api_url: String,
    pub tiingo_api_url: String,
    /// Tiingo is used when set (TIINGO_API_KEY), Yahoo otherwise.
    pub tiingo_api_key: Option<String>,
    /// Seconds between scheduled scans (SCAN_INTERVAL_SECS)
    pub scan_interval_secs: u64,
    /// Tickers fetched and evaluated at once (SCAN_CONCURRENCY)
    pub scan_concurrency: usize,
    /// Retries after the first failed fetch, capped by FETCH_BACKOFF_MS (FETCH_RETRIES)
    pub fetch_retries: usize,
    /// Comma-separated universe (TICKERS). Takes precedence over UNIVERSE_PATH.
    pub tickers: Vec<String>,
    pub universe_path: Option<String>,
    /// JSON object ticker → sector name (SECTOR_MAP_PATH)
    pub sector_map_path: Option<String>,
    pub snapshot_path: String,
    pub criteria: Criteria,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode = match std::env::var("SCAN_MODE") {
            Ok(s) => s.parse::<ScanMode>().map_err(AppError::Config)?,
            Err(_) => ScanMode::Retest,
        };

        let weights = match std::env::var("SCORING_WEIGHTS_PATH") {
            Ok(path) => ScoringWeights::from_file(&path)
                .map_err(|e| AppError::Config(format!("SCORING_WEIGHTS_PATH {path}: {e}")))?,
            Err(_) => ScoringWeights::default(),
        };

        let weekly_defaults = WeeklyCriteria::default();
        let daily_defaults = DailyCriteria::default();
        let base_defaults = BaseCriteria::default();
        let criteria_defaults = Criteria::default();

        let criteria = Criteria {
            mode,
            weekly: WeeklyCriteria {
                dist_below_pct: env_parse("W_DIST_BELOW", weekly_defaults.dist_below_pct),
                dist_above_pct: env_parse("W_DIST_ABOVE", weekly_defaults.dist_above_pct),
                prior_run_min: env_parse("W_PRIOR_RUN", weekly_defaults.prior_run_min),
                correction_min: env_parse("W_CORRECTION", weekly_defaults.correction_min),
                vol_multiple: env_parse("W_VOL_MULT", weekly_defaults.vol_multiple),
            },
            daily: DailyCriteria {
                atr_min_pct: env_parse("D_ATR_MIN", daily_defaults.atr_min_pct),
                atr_max_pct: env_parse("D_ATR_MAX", daily_defaults.atr_max_pct),
                above_50sma_max: env_parse("D_ABOVE_50SMA", daily_defaults.above_50sma_max),
            },
            base: BaseCriteria {
                base_years: env_parse("BB_BASE_YEARS", base_defaults.base_years),
                range_max_pct: env_parse("BB_RANGE_PCT", base_defaults.range_max_pct),
                atr_max_pct: env_parse("BB_ATR_MAX", base_defaults.atr_max_pct),
                vol_multiple: env_parse("BB_VOL_MULT", base_defaults.vol_multiple),
                sma_lo_pct: env_parse("BB_SMA_LO", base_defaults.sma_lo_pct),
                sma_hi_pct: env_parse("BB_SMA_HI", base_defaults.sma_hi_pct),
            },
            weights,
            score_scale: env_parse("SCORE_SCALE", criteria_defaults.score_scale),
            min_display_score: env_parse("MIN_DISPLAY_SCORE", criteria_defaults.min_display_score),
            min_price: env_parse("MIN_PRICE", criteria_defaults.min_price),
        };

        if criteria.score_scale <= 0.0 {
            return Err(AppError::Config("SCORE_SCALE must be positive".to_string()));
        }

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "scanner.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            yahoo_api_url: std::env::var("YAHOO_API_URL")
                .unwrap_or_else(|_| YAHOO_API_URL.to_string()),
            tiingo_api_url: std::env::var("TIINGO_API_URL")
                .unwrap_or_else(|_| TIINGO_API_URL.to_string()),
            tiingo_api_key: std::env::var("TIINGO_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            scan_interval_secs: env_parse("SCAN_INTERVAL_SECS", 6 * 3600),
            scan_concurrency: env_parse("SCAN_CONCURRENCY", 8usize).max(1),
            fetch_retries: env_parse("FETCH_RETRIES", 2usize).min(FETCH_BACKOFF_MS.len()),
            tickers: parse_ticker_list(&std::env::var("TICKERS").unwrap_or_default()),
            universe_path: std::env::var("UNIVERSE_PATH").ok(),
            sector_map_path: std::env::var("SECTOR_MAP_PATH").ok(),
            snapshot_path: std::env::var("SNAPSHOT_PATH")
                .unwrap_or_else(|_| "scan_snapshot.json".to_string()),
            criteria,
        })
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Comma or newline separated tickers, upper-cased, `#` comments skipped.
pub fn parse_ticker_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in raw.split([',', '\n']) {
        let token = token.split('#').next().unwrap_or("").trim();
        if token.is_empty() {
            continue;
        }
        let ticker = token.to_uppercase();
        if !out.contains(&ticker) {
            out.push(ticker);
        }
    }
    out
}
