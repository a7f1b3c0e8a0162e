use crate::config::thresholds::{
    ATH_EXCLUDE_BARS, MULTIYEAR_VOL_LOOKBACK, MULTIYEAR_VOL_RATIO, RESISTANCE_FLIP_MAX_PCT,
    SLOPE_ACCEL_ESCAPE, SLOPE_DECLINING_MAX, SLOPE_RISING_MIN, UNDERCUT_LOOKBACK,
};
use crate::config::{WeeklyCriteria, MIN_WEEKLY_BARS};
use crate::error::EvalError;
use crate::evaluator::TickerContext;
use crate::indicators::{
    max_of, min_of, nth_back, pct_change, percentile_rank, rolling_mean_last, sma, volume_ratio,
};
use crate::types::{PriceSeries, SlopeGrade, Verdict, WeeklyMetrics};

/// Weekly retest criteria: 200W SMA proximity, prior run, correction depth and
/// volume surge, plus the graded SMA slope and the un-gated bonus signals.
pub fn check_weekly(
    series: &PriceSeries,
    criteria: &WeeklyCriteria,
    ctx: &TickerContext,
) -> Result<Verdict<WeeklyMetrics>, EvalError> {
    let n = series.len();
    if n < MIN_WEEKLY_BARS {
        return Err(EvalError::InsufficientHistory { have: n, need: MIN_WEEKLY_BARS });
    }

    let closes = series.closes();
    let lows = series.lows();
    let vols = series.volumes();
    let close = closes[n - 1];

    let sma_period = 200.min(n - 1);
    let sma_series = sma(&closes, sma_period);
    let sma200 = sma_series[n - 1].unwrap_or(close);
    let dist = pct_change(sma200, close).unwrap_or(0.0);

    // High/low of the history before the most recent rally window.
    let win_end = n.saturating_sub(ATH_EXCLUDE_BARS);
    let window = if win_end > 0 { &closes[..win_end] } else { &closes[..1] };
    let window_high = max_of(window).unwrap_or(close);
    let window_low = min_of(window).unwrap_or(close);
    let prior_run = if window_low > 0.0 {
        (window_high - window_low) / window_low * 100.0
    } else {
        0.0
    };
    let correction = if window_high > close {
        (window_high - close) / window_high * 100.0
    } else {
        0.0
    };

    let run_threshold = match ctx.run_threshold {
        Some(sector_min) => criteria.prior_run_min.min(sector_min),
        None => criteria.prior_run_min,
    };

    // Sustained accumulation or one explosive week, whichever is larger.
    let ratios = volume_ratio(&vols, 4, 20, 12);
    let mut vol_ratio = ratios.best();
    let avg20 = rolling_mean_last(&vols, 20).unwrap_or(0.0);

    let mut adr_vol_pct_rank = None;
    let is_adr = ctx.is_adr && avg20 > 0.0;
    if is_adr {
        let avg4 = rolling_mean_last(&vols, 4).unwrap_or(0.0);
        let rank = percentile_rank(&vols[n.saturating_sub(52)..], avg4).unwrap_or(0.0);
        vol_ratio = vol_ratio.max(adr_ratio_floor(rank));
        adr_vol_pct_rank = Some(rank);
    }

    let (multiyear_vol_high, vol_rank_pct) = multiyear_volume(&vols);
    let undercut_weeks_ago = undercut_reclaim(&sma_series, &lows, &closes);
    let (slope_pct, slope_accel) = sma_slope(&sma_series);
    let slope_grade = grade_slope(slope_pct, slope_accel);
    let resistance_level = resistance_flip(&closes);

    let metrics = WeeklyMetrics {
        close,
        sma200,
        sma_period,
        dist_sma200_pct: dist,
        window_high,
        window_low,
        prior_run_pct: prior_run,
        correction_pct: correction,
        vol_ratio,
        vol_ratio_rolling: ratios.rolling,
        vol_ratio_peak: ratios.peak,
        slope_pct,
        slope_accel,
        slope_grade,
        run_threshold,
        pass_sma_proximity: -criteria.dist_below_pct <= dist && dist <= criteria.dist_above_pct,
        pass_prior_run: prior_run >= run_threshold,
        pass_correction: correction >= criteria.correction_min,
        pass_volume_surge: vol_ratio >= criteria.vol_multiple,
        undercut_reclaim: undercut_weeks_ago.is_some(),
        undercut_weeks_ago,
        multiyear_vol_high,
        vol_rank_pct,
        resistance_flip: resistance_level.is_some(),
        resistance_level,
        is_adr,
        adr_vol_pct_rank,
    };

    Ok(Verdict { pass: metrics.passed(), metrics })
}

/// Rising iff slope >= +0.10%; declining iff slope <= -0.10% and acceleration
/// below +0.05%; flattening otherwise.
pub fn grade_slope(slope_pct: f64, accel: f64) -> SlopeGrade {
    if slope_pct >= SLOPE_RISING_MIN {
        SlopeGrade::Rising
    } else if slope_pct <= SLOPE_DECLINING_MAX && accel < SLOPE_ACCEL_ESCAPE {
        SlopeGrade::Declining
    } else {
        SlopeGrade::Flattening
    }
}

/// 5-bar % change of the SMA and its change versus the prior 5-bar window.
/// Zero when any of the three SMA points is undefined.
fn sma_slope(sma_series: &[Option<f64>]) -> (f64, f64) {
    let points = (
        nth_back(sma_series, 1).flatten(),
        nth_back(sma_series, 5).flatten(),
        nth_back(sma_series, 9).flatten(),
    );
    let (Some(now), Some(mid), Some(old)) = points else {
        return (0.0, 0.0);
    };
    let slope_now = pct_change(mid, now).unwrap_or(0.0);
    let slope_prev = pct_change(old, mid).unwrap_or(0.0);
    (slope_now, slope_now - slope_prev)
}

/// ADR volume rank within its own 52-bar history mapped to an equivalent surge ratio.
fn adr_ratio_floor(rank: f64) -> f64 {
    if rank >= 95.0 {
        2.5
    } else if rank >= 80.0 {
        1.5
    } else if rank >= 60.0 {
        1.2
    } else {
        0.0
    }
}

/// Recent 12-bar peak against the largest volume of the prior ~3 years
/// (last bar excluded). Returns (flag, peak as % of that max).
fn multiyear_volume(vols: &[f64]) -> (bool, f64) {
    let n = vols.len();
    let lookback = MULTIYEAR_VOL_LOOKBACK.min(n - 1);
    let hist_max = if lookback > 1 {
        max_of(&vols[n - lookback..n - 1]).unwrap_or(0.0)
    } else {
        0.0
    };
    let recent_peak = max_of(&vols[n.saturating_sub(12)..]).unwrap_or(0.0);
    if hist_max <= 0.0 {
        return (false, 0.0);
    }
    (
        recent_peak >= hist_max * MULTIYEAR_VOL_RATIO,
        recent_peak / hist_max * 100.0,
    )
}

/// Most recent bar in the lookback whose low pierced the SMA while the close held above it.
fn undercut_reclaim(sma_series: &[Option<f64>], lows: &[f64], closes: &[f64]) -> Option<usize> {
    let n = closes.len();
    (1..=UNDERCUT_LOOKBACK.min(n - 1)).find(|&back| {
        let i = n - back;
        matches!(sma_series[i], Some(s) if lows[i] < s && closes[i] > s)
    })
}

/// Max close of bars 52..26 back; returned when the close sits 0–3% above it.
fn resistance_flip(closes: &[f64]) -> Option<f64> {
    let n = closes.len();
    if n < 52 {
        return None;
    }
    let level = max_of(&closes[n - 52..n - 26])?;
    let dist = pct_change(level, closes[n - 1])?;
    (0.0..=RESISTANCE_FLIP_MAX_PCT).contains(&dist).then_some(level)
}
