use crate::config::thresholds::{
    BASING_ATR_CONTRACTION, BASING_RANGE_MAX_PCT, BASING_VOL_DRY, BREAKOUT_BUFFER,
    BREAKOUT_VOL_MULT, CANDLE_POSITION_MIN, DOT_ATR_MULT, DOT_LOOKBACK, EMA_SPREAD_MIN, P50_FLOOR,
    RECLAIM_VOL_MULT,
};
use crate::config::{DailyCriteria, ExhaustionPoints, MIN_DAILY_BARS};
use crate::error::EvalError;
use crate::indicators::{
    atr_pct, ema, max_of, mean, min_of, nth_back, pct_change, rolling_mean_last, sma, AtrMode,
};
use crate::types::{Bar, DailyMetrics, Exhaustion, ExhaustionStage, PriceSeries, Verdict};

/// Daily confirmation: ATR band, distance from the 50-day SMA, EMA10/EMA20
/// spread, candle position, and the two-stage ATR exhaustion signal.
pub fn check_daily(
    series: &PriceSeries,
    criteria: &DailyCriteria,
    points: &ExhaustionPoints,
) -> Result<Verdict<DailyMetrics>, EvalError> {
    let n = series.len();
    if n < MIN_DAILY_BARS {
        return Err(EvalError::InsufficientHistory { have: n, need: MIN_DAILY_BARS });
    }

    let bars = series.bars();
    let closes = series.closes();
    let today = bars[n - 1];
    let close = today.close;

    let sma50_series = sma(&closes, 50);
    let ema10_series = ema(&closes, 10);
    let ema20_series = ema(&closes, 20);

    let sma50 = sma50_series[n - 1].unwrap_or(close);
    let ema10 = ema10_series[n - 1];
    let ema20 = ema20_series[n - 1];
    let atr = atr_pct(bars, 14, AtrMode::Median).unwrap_or(0.0);
    let pct_from_sma50 = pct_change(sma50, close).unwrap_or(0.0);
    let ema_spread = pct_change(ema20, ema10).unwrap_or(0.0);
    let candle_position = if today.high != today.low {
        (close - today.low) / (today.high - today.low)
    } else {
        0.5
    };

    let sma50_slope = match (nth_back(&sma50_series, 1).flatten(), nth_back(&sma50_series, 20).flatten()) {
        (Some(now), Some(then)) => pct_change(then, now).unwrap_or(0.0),
        _ => 0.0,
    };
    let sma50_rising = sma50_slope > 0.0;

    let atr_abs = atr / 100.0 * close;
    let atr_mult = if atr_abs > 0.0 { (close - sma50) / atr_abs } else { 0.0 };

    let exhaustion = if sma50_rising && atr_abs > 0.0 {
        let tape = Tape {
            bars,
            closes: &closes,
            sma50: &sma50_series,
            ema10: &ema10_series,
            atr_abs,
        };
        detect_exhaustion(&tape, points)
    } else {
        Exhaustion::quiet()
    };

    let metrics = DailyMetrics {
        close,
        atr_pct: atr,
        sma50,
        pct_from_sma50,
        ema10,
        ema20,
        ema_spread_pct: ema_spread,
        candle_position,
        sma50_slope_pct: sma50_slope,
        sma50_rising,
        atr_mult_from_sma50: atr_mult,
        exhaustion,
        pass_atr: criteria.atr_min_pct <= atr && atr <= criteria.atr_max_pct,
        pass_50sma: P50_FLOOR <= pct_from_sma50 && pct_from_sma50 <= criteria.above_50sma_max,
        pass_ema_cross: ema_spread > EMA_SPREAD_MIN,
        pass_candle: candle_position >= CANDLE_POSITION_MIN,
    };

    Ok(Verdict { pass: metrics.passed(), metrics })
}

/// Series views shared by the exhaustion checks. Only built when the 50-day SMA is rising.
struct Tape<'a> {
    bars: &'a [Bar],
    closes: &'a [f64],
    sma50: &'a [Option<f64>],
    ema10: &'a [f64],
    /// Today's ATR in price terms, used for every bar in the lookback.
    atr_abs: f64,
}

fn detect_exhaustion(tape: &Tape<'_>, points: &ExhaustionPoints) -> Exhaustion {
    let Some((days_ago, mult)) = find_dot(tape) else {
        return Exhaustion::quiet();
    };

    let breakout = is_breakout(tape);
    let reclaim = is_ma_reclaim(tape);
    let basing = basing_state(tape);
    let (stage, pts) = pick_stage(breakout, reclaim, basing, points);

    Exhaustion {
        dot_fired: true,
        dot_days_ago: Some(days_ago),
        dot_atr_mult: Some(mult),
        stage,
        points: pts,
    }
}

/// Most recent bar (1 = today) that closed at or below -10 ATR from its 50-day SMA.
fn find_dot(tape: &Tape<'_>) -> Option<(usize, f64)> {
    let n = tape.closes.len();
    (1..=DOT_LOOKBACK.min(n - 1)).find_map(|back| {
        let i = n - back;
        let sma = tape.sma50[i]?;
        let mult = (tape.closes[i] - sma) / tape.atr_abs;
        (mult <= DOT_ATR_MULT).then_some((back, mult))
    })
}

/// Stage 2 in fixed priority: breakout, then MA reclaim, then basing, else watching.
/// `basing` is `Some(volume_dry)` when the basing conditions hold.
pub fn pick_stage(
    breakout: bool,
    reclaim: bool,
    basing: Option<bool>,
    points: &ExhaustionPoints,
) -> (ExhaustionStage, i32) {
    if breakout {
        (ExhaustionStage::Breakout, points.breakout)
    } else if reclaim {
        (ExhaustionStage::MaReclaim, points.ma_reclaim)
    } else if let Some(dry) = basing {
        let pts = if dry { points.basing_dry_volume } else { points.basing };
        (ExhaustionStage::Basing, pts)
    } else {
        (ExhaustionStage::Watching, 0)
    }
}

fn volume_avg20(tape: &Tape<'_>) -> Option<f64> {
    let vols: Vec<f64> = tape.bars.iter().map(|b| b.volume).collect();
    rolling_mean_last(&vols, 20)
}

/// Close clears the prior 5-day high by the buffer on a volume surge.
fn is_breakout(tape: &Tape<'_>) -> bool {
    let n = tape.bars.len();
    if n < 6 {
        return false;
    }
    let prior_highs: Vec<f64> = tape.bars[n - 6..n - 1].iter().map(|b| b.high).collect();
    let (Some(range_high), Some(avg20)) = (max_of(&prior_highs), volume_avg20(tape)) else {
        return false;
    };
    let today = tape.bars[n - 1];
    today.close > range_high * BREAKOUT_BUFFER && today.volume >= avg20 * BREAKOUT_VOL_MULT
}

/// Yesterday below the 10-day EMA, today back above it, EMA not falling over 5 bars,
/// volume expanding.
fn is_ma_reclaim(tape: &Tape<'_>) -> bool {
    let n = tape.closes.len();
    if n < 5 {
        return false;
    }
    let was_below = tape.closes[n - 2] < tape.ema10[n - 2];
    let now_above = tape.closes[n - 1] >= tape.ema10[n - 1];
    let ema_turning = pct_change(tape.ema10[n - 5], tape.ema10[n - 1]).unwrap_or(0.0) >= 0.0;
    let vol_expanding = volume_avg20(tape)
        .is_some_and(|avg20| tape.bars[n - 1].volume >= avg20 * RECLAIM_VOL_MULT);
    was_below && now_above && ema_turning && vol_expanding
}

/// ATR contracting and price coiling in a tight 5-day range.
/// Returns whether volume is also drying up.
fn basing_state(tape: &Tape<'_>) -> Option<bool> {
    let n = tape.bars.len();
    if n < 15 {
        return None;
    }
    let recent = &tape.bars[n - 5..];
    let atr_5d = atr_pct(recent, 14, AtrMode::Median)?;
    let atr_10d = atr_pct(&tape.bars[n - 15..n - 5], 14, AtrMode::Median)?;

    let highs: Vec<f64> = recent.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = recent.iter().map(|b| b.low).collect();
    let range_hi = max_of(&highs)?;
    let range_lo = min_of(&lows)?;
    let range_pct = if range_lo > 0.0 {
        (range_hi - range_lo) / range_lo * 100.0
    } else {
        f64::INFINITY
    };

    let contracting = atr_5d < atr_10d * BASING_ATR_CONTRACTION;
    let coiling = range_pct < BASING_RANGE_MAX_PCT;
    if !(contracting && coiling) {
        return None;
    }

    let vols: Vec<f64> = recent.iter().map(|b| b.volume).collect();
    let dry = match (mean(&vols), volume_avg20(tape)) {
        (Some(avg5), Some(avg20)) => avg5 < avg20 * BASING_VOL_DRY,
        _ => false,
    };
    Some(dry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::test_support::{daily_bars, series_from};

    fn run(series: &PriceSeries) -> Verdict<DailyMetrics> {
        check_daily(series, &DailyCriteria::default(), &ExhaustionPoints::default()).unwrap()
    }

    /// Uptrend of +0.5/day from 100 with a one-day flush to 100 at bar 110.
    fn flushed_uptrend(last_close_bump: f64, last_volume: f64) -> PriceSeries {
        let mut closes: Vec<f64> = (0..130).map(|i| 100.0 + 0.5 * i as f64).collect();
        closes[110] = 100.0;
        *closes.last_mut().unwrap() += last_close_bump;
        let mut vols = vec![1000.0; closes.len()];
        *vols.last_mut().unwrap() = last_volume;
        series_from(daily_bars(&closes, &vols))
    }

    #[test]
    fn short_history_is_an_error() {
        let s = series_from(daily_bars(&[10.0; 54], &[1.0; 54]));
        let err = check_daily(&s, &DailyCriteria::default(), &ExhaustionPoints::default()).unwrap_err();
        assert_eq!(err, EvalError::InsufficientHistory { have: 54, need: 55 });
    }

    #[test]
    fn dot_then_breakout_on_double_volume() {
        let v = run(&flushed_uptrend(4.0, 2000.0));
        let ex = &v.metrics.exhaustion;
        assert!(v.metrics.sma50_rising);
        assert!(ex.dot_fired);
        assert_eq!(ex.dot_days_ago, Some(20));
        assert!(ex.dot_atr_mult.unwrap() <= -10.0);
        assert_eq!(ex.stage, ExhaustionStage::Breakout);
        assert_eq!(ex.points, 12);
    }

    /// Rising +0.5/day tape with high/low at ±1, so every quiet bar has a true range of 2.
    /// Bar 124 flushes to `flush`; bar 75 is trimmed by 4.5 so the 50-day SMA at
    /// bar 124 is exactly 99. The last bar closes at 128 on double volume.
    fn exact_flush(flush: f64) -> PriceSeries {
        let mut closes: Vec<f64> = (0..130).map(|i| 50.0 + 0.5 * i as f64).collect();
        closes[75] -= 4.5;
        closes[124] = flush;
        closes[129] = 128.0;
        let mut vols = vec![1000.0; closes.len()];
        vols[129] = 2000.0;
        let start = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let bars = closes
            .iter()
            .zip(&vols)
            .enumerate()
            .map(|(i, (&close, &volume))| Bar {
                date: start + chrono::Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume,
            })
            .collect();
        series_from(bars)
    }

    #[test]
    fn close_exactly_ten_atr_below_sma_is_a_dot() {
        let v = run(&exact_flush(79.0));
        let ex = &v.metrics.exhaustion;
        // today's median true range is the yardstick: 2.0 in price terms
        assert_eq!(v.metrics.atr_pct, 2.0 / 128.0 * 100.0);
        assert!(v.metrics.sma50_rising);
        assert!(ex.dot_fired);
        assert_eq!(ex.dot_days_ago, Some(6));
        assert_eq!(ex.dot_atr_mult, Some(-10.0));
        assert_eq!(ex.stage, ExhaustionStage::Breakout);
        assert_eq!(ex.points, 12);

        // half a point higher is -9.76 ATR: no dot
        let v = run(&exact_flush(79.5));
        assert!(!v.metrics.exhaustion.dot_fired);
        assert_eq!(v.metrics.exhaustion.stage, ExhaustionStage::None);
    }

    #[test]
    fn dot_without_response_is_watching() {
        let v = run(&flushed_uptrend(0.0, 1000.0));
        let ex = &v.metrics.exhaustion;
        assert!(ex.dot_fired);
        assert_eq!(ex.stage, ExhaustionStage::Watching);
        assert_eq!(ex.points, 0);
    }

    #[test]
    fn no_dot_means_no_stage() {
        let closes: Vec<f64> = (0..130).map(|i| 100.0 + 0.5 * i as f64).collect();
        let mut vols = vec![1000.0; closes.len()];
        *vols.last_mut().unwrap() = 3000.0;
        let v = run(&series_from(daily_bars(&closes, &vols)));
        assert!(!v.metrics.exhaustion.dot_fired);
        assert_eq!(v.metrics.exhaustion.stage, ExhaustionStage::None);
        assert_eq!(v.metrics.exhaustion.points, 0);
    }

    #[test]
    fn falling_sma_suppresses_the_dot() {
        let mut closes: Vec<f64> = (0..130).map(|i| 200.0 - 0.5 * i as f64).collect();
        closes[110] = 60.0;
        let vols = vec![1000.0; closes.len()];
        let v = run(&series_from(daily_bars(&closes, &vols)));
        assert!(!v.metrics.sma50_rising);
        assert!(!v.metrics.exhaustion.dot_fired);
        assert_eq!(v.metrics.exhaustion.stage, ExhaustionStage::None);
    }

    #[test]
    fn stage_priority_is_fixed() {
        let p = ExhaustionPoints::default();
        assert_eq!(pick_stage(true, true, Some(true), &p), (ExhaustionStage::Breakout, 12));
        assert_eq!(pick_stage(false, true, Some(true), &p), (ExhaustionStage::MaReclaim, 8));
        assert_eq!(pick_stage(false, false, Some(true), &p), (ExhaustionStage::Basing, 10));
        assert_eq!(pick_stage(false, false, Some(false), &p), (ExhaustionStage::Basing, 8));
        assert_eq!(pick_stage(false, false, None, &p), (ExhaustionStage::Watching, 0));
    }

    #[test]
    fn flat_tape_gates() {
        let v = run(&series_from(daily_bars(&[20.0; 80], &[1000.0; 80])));
        let m = &v.metrics;
        // ±1% bars: 2% ATR sits below the 3% floor
        assert!((m.atr_pct - 2.0).abs() < 1e-9);
        assert!(!m.pass_atr);
        assert!(m.pass_50sma);
        assert!(m.pass_ema_cross);
        assert!((m.candle_position - 0.5).abs() < 1e-9);
        assert!(m.pass_candle);
        assert!(!v.pass);
    }
}
