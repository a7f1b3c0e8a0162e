use crate::config::thresholds::{
    BASE_DURATION_BAND_HI, BASE_DURATION_BAND_LO, BASE_MIN_WINDOW, BASE_SLOPE_MIN,
    GROWTH_DIST_MIN, GROWTH_MAX_DURATION, GROWTH_MIN_DURATION,
};
use crate::config::{BaseCriteria, MIN_WEEKLY_BARS};
use crate::error::EvalError;
use crate::indicators::{atr_pct, ema, max_of, min_of, nth_back, pct_change, rolling_mean_last, sma, AtrMode};
use crate::types::{BaseBreakoutMetrics, BaseSubtype, PriceSeries, Verdict};

/// Base ATR is not trusted below this many bars.
const BASE_ATR_MIN_BARS: usize = 14;
const UNMEASURED: f64 = 999.0;

/// Multi-year sideways base breaking out on volume.
///
/// The base window is the last `base_years * 52` bars before the current one.
pub fn check_base_breakout(
    series: &PriceSeries,
    criteria: &BaseCriteria,
) -> Result<Verdict<BaseBreakoutMetrics>, EvalError> {
    let n = series.len();
    if n < MIN_WEEKLY_BARS {
        return Err(EvalError::InsufficientHistory { have: n, need: MIN_WEEKLY_BARS });
    }

    let bars = series.bars();
    let closes = series.closes();
    let close = closes[n - 1];
    let base_weeks = criteria.base_weeks();

    let start = if n > base_weeks { n - 1 - base_weeks } else { 0 };
    let window = &closes[start..n - 1];
    if window.len() < BASE_MIN_WINDOW {
        return Err(EvalError::InsufficientHistory {
            have: window.len(),
            need: BASE_MIN_WINDOW,
        });
    }

    let base_high = max_of(window).unwrap_or(close);
    let base_low = min_of(window).unwrap_or(close);
    let range_pct = pct_change(base_low, base_high).unwrap_or(UNMEASURED);

    let base_bars = &bars[start..n - 1];
    let base_atr_pct = if base_bars.len() >= BASE_ATR_MIN_BARS {
        atr_pct(base_bars, base_bars.len(), AtrMode::Mean).unwrap_or(UNMEASURED)
    } else {
        UNMEASURED
    };

    let volumes = series.volumes();
    let vol_ratio = match (rolling_mean_last(&volumes, 4), rolling_mean_last(&volumes, 20)) {
        (Some(short), Some(long)) if long > 0.0 => short / long,
        _ => 0.0,
    };

    let (lo, hi) = (base_low * BASE_DURATION_BAND_LO, base_high * BASE_DURATION_BAND_HI);
    let floor = n.saturating_sub(2 * base_weeks);
    let duration_weeks = (floor..=n - 2)
        .rev()
        .take_while(|&i| (lo..=hi).contains(&closes[i]))
        .count();

    let sma200_series = sma(&closes, 200.min(n - 1));
    let sma200 = sma200_series[n - 1].unwrap_or(close);
    let dist_sma200_pct = pct_change(sma200, close).unwrap_or(0.0);
    let sma_slope = match (nth_back(&sma200_series, 1).flatten(), nth_back(&sma200_series, 5).flatten()) {
        (Some(now), Some(then)) => now - then,
        _ => 0.0,
    };

    let ema10 = ema(&closes, 10)[n - 1];
    let ema20 = ema(&closes, 20)[n - 1];
    let sma50 = sma(&closes, 50.min(n - 1))[n - 1].unwrap_or(close);
    let ma_alignment = [sma50 > sma200, ema10 > ema20, ema20 > sma50, close > ema10]
        .iter()
        .filter(|&&c| c)
        .count() as u8;

    let subtype = if dist_sma200_pct > GROWTH_DIST_MIN
        && ma_alignment >= 3
        && duration_weeks <= GROWTH_MAX_DURATION
    {
        BaseSubtype::Growth
    } else {
        BaseSubtype::Commodity
    };
    let pass_duration = match subtype {
        BaseSubtype::Growth => duration_weeks >= GROWTH_MIN_DURATION,
        BaseSubtype::Commodity => duration_weeks as f64 >= criteria.base_years * 52.0 * 0.5,
    };

    let metrics = BaseBreakoutMetrics {
        close,
        sma200,
        dist_sma200_pct,
        base_weeks: window.len(),
        base_high,
        base_low,
        range_pct,
        base_atr_pct,
        vol_ratio,
        duration_weeks,
        sma_slope,
        ema10,
        ema20,
        sma50,
        ma_alignment,
        subtype,
        pass_sma_proximity: -criteria.sma_lo_pct <= dist_sma200_pct
            && dist_sma200_pct <= criteria.sma_hi_pct,
        pass_range: range_pct <= criteria.range_max_pct,
        pass_atr: base_atr_pct <= criteria.atr_max_pct,
        pass_volume_surge: vol_ratio >= criteria.vol_multiple,
        pass_duration,
        pass_slope: sma_slope >= BASE_SLOPE_MIN,
    };

    Ok(Verdict { pass: metrics.passed(), metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::test_support::{series_from, weekly_bars};

    fn surge_volumes(n: usize) -> Vec<f64> {
        let mut vols = vec![1000.0; n];
        for v in vols.iter_mut().skip(n - 4) {
            *v = 3000.0;
        }
        vols
    }

    /// 200 weeks chopping between 19.8 and 20.2.
    fn tight_commodity_base() -> Vec<f64> {
        (0..200).map(|i| if i % 2 == 0 { 19.8 } else { 20.2 }).collect()
    }

    #[test]
    fn tight_base_on_volume_passes_as_commodity() {
        let closes = tight_commodity_base();
        let series = series_from(weekly_bars(&closes, &surge_volumes(closes.len())));
        let v = check_base_breakout(&series, &BaseCriteria::default()).unwrap();
        let m = &v.metrics;
        assert_eq!(m.base_weeks, 104);
        assert!(m.range_pct < 5.0);
        assert!(m.base_atr_pct < 4.0);
        // (16 * 1000 + 4 * 3000) / 20 = 1400; 3000 / 1400
        assert!((m.vol_ratio - 3000.0 / 1400.0).abs() < 1e-9);
        assert_eq!(m.duration_weeks, 199);
        assert_eq!(m.subtype, BaseSubtype::Commodity);
        assert!(m.pass_slope);
        assert!(v.pass);
    }

    #[test]
    fn no_volume_surge_fails() {
        let closes = tight_commodity_base();
        let series = series_from(weekly_bars(&closes, &vec![1000.0; closes.len()]));
        let v = check_base_breakout(&series, &BaseCriteria::default()).unwrap();
        assert_eq!(v.metrics.vol_ratio, 1.0);
        assert!(!v.metrics.pass_volume_surge);
        assert!(!v.pass);
    }

    #[test]
    fn extended_stacked_short_base_is_growth() {
        let mut closes = vec![10.0; 100];
        closes.extend((1..=40).map(|k| 10.0 + 0.75 * k as f64));
        closes.extend(std::iter::repeat(40.0).take(70));
        closes.push(41.0);
        let series = series_from(weekly_bars(&closes, &surge_volumes(closes.len())));
        let m = check_base_breakout(&series, &BaseCriteria::default()).unwrap().metrics;
        assert!(m.dist_sma200_pct > 50.0);
        assert!(m.ma_alignment >= 3);
        assert!(m.duration_weeks <= 130);
        assert_eq!(m.subtype, BaseSubtype::Growth);
        assert!(m.pass_duration);
        assert!(!m.pass_sma_proximity);
    }

    #[test]
    fn short_history_and_short_window_are_insufficient() {
        let closes = vec![20.0; 51];
        let series = series_from(weekly_bars(&closes, &closes));
        assert!(matches!(
            check_base_breakout(&series, &BaseCriteria::default()),
            Err(EvalError::InsufficientHistory { have: 51, need: 52 })
        ));

        let closes = vec![20.0; 80];
        let series = series_from(weekly_bars(&closes, &closes));
        let criteria = BaseCriteria { base_years: 0.25, ..BaseCriteria::default() };
        assert!(matches!(
            check_base_breakout(&series, &criteria),
            Err(EvalError::InsufficientHistory { have: 13, need: 26 })
        ));
    }
}
