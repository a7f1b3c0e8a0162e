use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Weekly,
    Daily,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::Weekly => write!(f, "weekly"),
            Granularity::Daily => write!(f, "daily"),
        }
    }
}

/// Bars in strictly increasing date order. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceSeries {
    bars: Vec<Bar>,
}

impl PriceSeries {
    /// Build from bars that must already be in strictly increasing date order.
    pub fn new(bars: Vec<Bar>) -> Result<Self> {
        if let Some(w) = bars.windows(2).find(|w| w[1].date <= w[0].date) {
            return Err(AppError::Data(format!(
                "bars out of order or duplicated at {} -> {}",
                w[0].date, w[1].date
            )));
        }
        Ok(Self { bars })
    }

    /// Sort by date and keep the last bar seen for each date.
    pub fn normalized(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.date);
        let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match out.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => out.push(bar),
            }
        }
        Self { bars: out }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    /// Only the bars dated on or before `date`.
    pub fn as_of(&self, date: NaiveDate) -> Self {
        let end = self.bars.partition_point(|b| b.date <= date);
        Self { bars: self.bars[..end].to_vec() }
    }
}

// ---------------------------------------------------------------------------
// Scan mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// 200W SMA retest after a large run and deep correction.
    Retest,
    /// Multi-year sideways base breaking out on volume.
    BaseBreakout,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanMode::Retest => write!(f, "retest"),
            ScanMode::BaseBreakout => write!(f, "base_breakout"),
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "retest" => Ok(ScanMode::Retest),
            "base" | "base_breakout" => Ok(ScanMode::BaseBreakout),
            other => Err(format!("unknown scan mode {other:?}, expected retest or base_breakout")),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlopeGrade {
    Rising,
    Flattening,
    Declining,
}

impl std::fmt::Display for SlopeGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlopeGrade::Rising => "rising",
            SlopeGrade::Flattening => "flattening",
            SlopeGrade::Declining => "declining",
        };
        write!(f, "{s}")
    }
}

/// Stage 2 response after an extension dot. `None` means the dot never fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionStage {
    Breakout,
    MaReclaim,
    Basing,
    Watching,
    None,
}

impl std::fmt::Display for ExhaustionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExhaustionStage::Breakout => "breakout",
            ExhaustionStage::MaReclaim => "ma_reclaim",
            ExhaustionStage::Basing => "basing",
            ExhaustionStage::Watching => "watching",
            ExhaustionStage::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    MaStack,
    BounceEma,
    FirstPullback,
    None,
}

impl std::fmt::Display for StructureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StructureKind::MaStack => "ma_stack",
            StructureKind::BounceEma => "bounce_ema",
            StructureKind::FirstPullback => "first_pullback",
            StructureKind::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackTier {
    /// 4 of 4 stack conditions.
    Full,
    /// Exactly 3 of 4.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseSubtype {
    Growth,
    Commodity,
}

impl std::fmt::Display for BaseSubtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseSubtype::Growth => write!(f, "growth"),
            BaseSubtype::Commodity => write!(f, "commodity"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCategory {
    Watchlist,
    Strong,
    FullHit,
}

impl ScoreCategory {
    /// Thresholds are percentages of the normalized 0–100 score.
    pub fn from_normalized(score: f64) -> Self {
        use crate::config::thresholds::{FULL_HIT_PCT, STRONG_PCT};
        if score >= FULL_HIT_PCT {
            ScoreCategory::FullHit
        } else if score >= STRONG_PCT {
            ScoreCategory::Strong
        } else {
            ScoreCategory::Watchlist
        }
    }
}

impl std::fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScoreCategory::FullHit => "full_hit",
            ScoreCategory::Strong => "strong",
            ScoreCategory::Watchlist => "watchlist",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScoreCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full_hit" | "full" => Ok(ScoreCategory::FullHit),
            "strong" => Ok(ScoreCategory::Strong),
            "watchlist" | "watch" => Ok(ScoreCategory::Watchlist),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator outputs
// ---------------------------------------------------------------------------

/// Pass/fail plus the complete metrics it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict<M> {
    pub pass: bool,
    pub metrics: M,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyMetrics {
    pub close: f64,
    pub sma200: f64,
    /// Effective period, `min(200, len - 1)`.
    pub sma_period: usize,
    pub dist_sma200_pct: f64,
    pub window_high: f64,
    pub window_low: f64,
    pub prior_run_pct: f64,
    pub correction_pct: f64,
    pub vol_ratio: f64,
    pub vol_ratio_rolling: f64,
    pub vol_ratio_peak: f64,
    pub slope_pct: f64,
    pub slope_accel: f64,
    pub slope_grade: SlopeGrade,
    /// min(configured floor, sector threshold)
    pub run_threshold: f64,
    pub pass_sma_proximity: bool,
    pub pass_prior_run: bool,
    pub pass_correction: bool,
    pub pass_volume_surge: bool,
    pub undercut_reclaim: bool,
    pub undercut_weeks_ago: Option<usize>,
    pub multiyear_vol_high: bool,
    pub vol_rank_pct: f64,
    pub resistance_flip: bool,
    pub resistance_level: Option<f64>,
    pub is_adr: bool,
    pub adr_vol_pct_rank: Option<f64>,
}

impl WeeklyMetrics {
    pub fn passed(&self) -> bool {
        self.pass_sma_proximity && self.pass_prior_run && self.pass_correction && self.pass_volume_surge
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exhaustion {
    pub dot_fired: bool,
    /// Bars back from today of the most recent dot (1 = today).
    pub dot_days_ago: Option<usize>,
    pub dot_atr_mult: Option<f64>,
    pub stage: ExhaustionStage,
    pub points: i32,
}

impl Exhaustion {
    pub fn quiet() -> Self {
        Self {
            dot_fired: false,
            dot_days_ago: None,
            dot_atr_mult: None,
            stage: ExhaustionStage::None,
            points: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub close: f64,
    pub atr_pct: f64,
    pub sma50: f64,
    pub pct_from_sma50: f64,
    pub ema10: f64,
    pub ema20: f64,
    pub ema_spread_pct: f64,
    pub candle_position: f64,
    pub sma50_slope_pct: f64,
    pub sma50_rising: bool,
    pub atr_mult_from_sma50: f64,
    pub exhaustion: Exhaustion,
    pub pass_atr: bool,
    pub pass_50sma: bool,
    pub pass_ema_cross: bool,
    pub pass_candle: bool,
}

impl DailyMetrics {
    pub fn passed(&self) -> bool {
        self.pass_atr && self.pass_50sma
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStructure {
    pub kind: StructureKind,
    pub stack_tier: Option<StackTier>,
    pub points: i32,
    pub label: String,
    pub ema10: f64,
    pub ema20: f64,
    pub sma50: f64,
    pub sma200: f64,
    /// Stack conditions met, 0..=4.
    pub stack_conditions: u8,
    /// Informational when a partial stack already claimed the points.
    pub bounce_ema: bool,
    pub first_pullback: bool,
    pub local_high_pct: f64,
    pub atr_contracting: bool,
}

impl RecoveryStructure {
    /// Used for base-breakout results, where the classifier does not run.
    pub fn not_applicable() -> Self {
        Self {
            kind: StructureKind::None,
            stack_tier: None,
            points: 0,
            label: "N/A".to_string(),
            ema10: 0.0,
            ema20: 0.0,
            sma50: 0.0,
            sma200: 0.0,
            stack_conditions: 0,
            bounce_ema: false,
            first_pullback: false,
            local_high_pct: 0.0,
            atr_contracting: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseBreakoutMetrics {
    pub close: f64,
    pub sma200: f64,
    pub dist_sma200_pct: f64,
    pub base_weeks: usize,
    pub base_high: f64,
    pub base_low: f64,
    pub range_pct: f64,
    pub base_atr_pct: f64,
    pub vol_ratio: f64,
    pub duration_weeks: usize,
    /// Dollar change of the SMA over the last 4 bars.
    pub sma_slope: f64,
    pub ema10: f64,
    pub ema20: f64,
    pub sma50: f64,
    pub ma_alignment: u8,
    pub subtype: BaseSubtype,
    pub pass_sma_proximity: bool,
    pub pass_range: bool,
    pub pass_atr: bool,
    pub pass_volume_surge: bool,
    pub pass_duration: bool,
    pub pass_slope: bool,
}

impl BaseBreakoutMetrics {
    pub fn passed(&self) -> bool {
        self.pass_sma_proximity
            && self.pass_range
            && self.pass_atr
            && self.pass_volume_surge
            && self.pass_duration
    }
}

/// Mode-specific weekly metrics on a scored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SetupMetrics {
    Retest(WeeklyMetrics),
    BaseBreakout(BaseBreakoutMetrics),
}

impl SetupMetrics {
    pub fn close(&self) -> f64 {
        match self {
            SetupMetrics::Retest(w) => w.close,
            SetupMetrics::BaseBreakout(b) => b.close,
        }
    }

    pub fn dist_sma200_pct(&self) -> f64 {
        match self {
            SetupMetrics::Retest(w) => w.dist_sma200_pct,
            SetupMetrics::BaseBreakout(b) => b.dist_sma200_pct,
        }
    }

    pub fn vol_ratio(&self) -> f64 {
        match self {
            SetupMetrics::Retest(w) => w.vol_ratio,
            SetupMetrics::BaseBreakout(b) => b.vol_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorSnapshot {
    pub name: String,
    pub etf: Option<String>,
    /// ETF 26W return minus the benchmark's, in percentage points.
    pub relative_return_pct: Option<f64>,
    pub points: i32,
}

impl SectorSnapshot {
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            etf: None,
            relative_return_pct: None,
            points: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub ticker: String,
    pub mode: ScanMode,
    /// Setup or base score before structure and sector adjustments.
    pub base_score: f64,
    pub bonus_score: f64,
    pub raw_score: f64,
    pub normalized_score: f64,
    pub category: ScoreCategory,
    pub weekly_pass: bool,
    pub daily_pass: bool,
    pub setup: SetupMetrics,
    pub daily: Option<DailyMetrics>,
    pub structure: RecoveryStructure,
    pub sector: SectorSnapshot,
    pub signal_summary: String,
    pub as_of: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Scan driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: i64,
    pub mode: Option<ScanMode>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub universe: usize,
    pub evaluated: usize,
    pub skipped_no_data: usize,
    pub skipped_short_history: usize,
    pub skipped_price_floor: usize,
    /// Evaluated with no usable daily series.
    pub daily_missing: usize,
    pub hits: usize,
    pub below_threshold: usize,
    pub full_hits: usize,
    pub strong: usize,
    pub watchlist: usize,
}

impl ScanSummary {
    pub fn skipped(&self) -> usize {
        self.skipped_no_data + self.skipped_short_history + self.skipped_price_floor
    }
}

/// Why a ticker was not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoData,
    ShortHistory,
    PriceFloor,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoData => write!(f, "no_data"),
            SkipReason::ShortHistory => write!(f, "short_history"),
            SkipReason::PriceFloor => write!(f, "price_floor"),
        }
    }
}

/// Progress reported by the scan driver.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started { scan_id: i64, universe: usize, mode: ScanMode },
    Evaluated { done: usize, total: usize, result: Box<ScoredResult>, hit: bool },
    Skipped { done: usize, total: usize, ticker: String, reason: SkipReason, detail: String },
    Finished(ScanSummary),
}

/// A completed scan handed to the result writer.
#[derive(Debug, Clone)]
pub struct CompletedScan {
    pub summary: ScanSummary,
    pub results: Vec<ScoredResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub ticker: String,
    pub score: f64,
    pub close: f64,
    pub sector: String,
    pub structure_label: String,
    pub slope_grade: Option<SlopeGrade>,
    pub added_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(day: u32, close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn new_rejects_duplicate_dates() {
        let err = PriceSeries::new(vec![bar(1, 1.0), bar(1, 2.0)]).unwrap_err();
        assert!(matches!(err, AppError::Data(_)));
    }

    #[test]
    fn new_rejects_descending_dates() {
        assert!(PriceSeries::new(vec![bar(2, 1.0), bar(1, 2.0)]).is_err());
        assert!(PriceSeries::new(vec![bar(1, 1.0), bar(2, 2.0)]).is_ok());
    }

    #[test]
    fn normalized_sorts_and_keeps_last_duplicate() {
        let s = PriceSeries::normalized(vec![bar(3, 3.0), bar(1, 1.0), bar(3, 4.0), bar(2, 2.0)]);
        assert_eq!(s.closes(), vec![1.0, 2.0, 4.0]);
        assert!(PriceSeries::new(s.bars().to_vec()).is_ok());
    }

    #[test]
    fn as_of_never_returns_later_bars() {
        let s = PriceSeries::normalized((1..=10).map(|d| bar(d, d as f64)).collect());
        let cut = s.as_of(NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert_eq!(cut.len(), 4);
        assert_eq!(cut.last().unwrap().close, 4.0);
        let before = s.as_of(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        assert!(before.is_empty());
    }

    #[test]
    fn category_thresholds_on_normalized_score() {
        assert_eq!(ScoreCategory::from_normalized(80.0), ScoreCategory::FullHit);
        assert_eq!(ScoreCategory::from_normalized(79.0), ScoreCategory::Strong);
        assert_eq!(ScoreCategory::from_normalized(60.0), ScoreCategory::Strong);
        assert_eq!(ScoreCategory::from_normalized(59.0), ScoreCategory::Watchlist);
    }

    #[test]
    fn scan_mode_parses_aliases() {
        assert_eq!("base".parse::<ScanMode>().unwrap(), ScanMode::BaseBreakout);
        assert_eq!("Retest".parse::<ScanMode>().unwrap(), ScanMode::Retest);
        assert!("momentum".parse::<ScanMode>().is_err());
    }
}
