//! Pure indicator functions over ordered price and volume series.
//!
//! Nothing here clamps periods to the available history; callers pick the
//! effective period (`min(200, len - 1)` and friends) and decide when a series
//! is too short to evaluate at all.

use crate::types::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtrMode {
    Mean,
    /// Suppresses single-bar gaps such as earnings.
    Median,
}

/// Simple moving average. `None` until `period` observations exist.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average seeded from the first observation.
/// Defined for every bar: `ema[i] = ema[i-1] + a * (x[i] - ema[i-1])`, `a = 2 / (period + 1)`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let Some(&first) = values.first() else {
        return Vec::new();
    };
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = first;
    out.push(prev);
    for &x in &values[1..] {
        prev += alpha * (x - prev);
        out.push(prev);
    }
    out
}

/// True range per bar. The first bar has no previous close and uses high - low.
pub fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, b)| {
            let hl = b.high - b.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev) => hl.max((b.high - prev).abs()).max((b.low - prev).abs()),
                None => hl,
            }
        })
        .collect()
}

/// ATR as a percentage of the last close, over the last `period` true ranges
/// (all of them when fewer exist). `None` for an empty slice or a zero close.
pub fn atr_pct(bars: &[Bar], period: usize, mode: AtrMode) -> Option<f64> {
    let last_close = bars.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    let tr = true_ranges(bars);
    let window = &tr[tr.len().saturating_sub(period.max(1))..];
    let atr = match mode {
        AtrMode::Mean => mean(window)?,
        AtrMode::Median => median(window)?,
    };
    Some(atr / last_close * 100.0)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Mean of the last `window` values. `None` when fewer exist.
pub fn rolling_mean_last(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    mean(&values[values.len() - window..])
}

/// Max over a slice. `None` when empty.
pub fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

pub fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

/// Value at `back` bars from the end, 1-based (`back = 1` is the last value).
pub fn nth_back<T: Copy>(values: &[T], back: usize) -> Option<T> {
    if back == 0 || back > values.len() {
        return None;
    }
    Some(values[values.len() - back])
}

/// Percentage change from `from` to `to`. `None` unless `from` is positive.
pub fn pct_change(from: f64, to: f64) -> Option<f64> {
    (from > 0.0).then(|| (to - from) / from * 100.0)
}

/// Share of `values` strictly below `x`, as a percentage.
pub fn percentile_rank(values: &[f64], x: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let below = values.iter().filter(|&&v| v < x).count();
    Some(below as f64 / values.len() as f64 * 100.0)
}

/// Surge ratios against the trailing `long` average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRatio {
    /// Short trailing average over the long trailing average.
    pub rolling: f64,
    /// Single largest volume in the last `peak_window` bars over the long average.
    pub peak: f64,
}

impl VolumeRatio {
    pub fn best(&self) -> f64 {
        self.rolling.max(self.peak)
    }
}

/// Both ratios are 0 when the long average is missing or zero, and exactly 1
/// when every volume the windows cover is the same.
pub fn volume_ratio(volumes: &[f64], short: usize, long: usize, peak_window: usize) -> VolumeRatio {
    let long_avg = rolling_mean_last(volumes, long).unwrap_or(0.0);
    if long_avg <= 0.0 {
        return VolumeRatio { rolling: 0.0, peak: 0.0 };
    }
    let span = long.max(short).max(peak_window).min(volumes.len());
    let covered = &volumes[volumes.len() - span..];
    if volumes.len() >= short && covered.iter().all(|&v| v == covered[0]) {
        // summation rounding would leave fractional volumes a hair off 1.0
        return VolumeRatio { rolling: 1.0, peak: 1.0 };
    }
    let short_avg = rolling_mean_last(volumes, short).unwrap_or(0.0);
    let peak = max_of(&volumes[volumes.len().saturating_sub(peak_window)..]).unwrap_or(0.0);
    VolumeRatio {
        rolling: short_avg / long_avg,
        peak: peak / long_avg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ohlc(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            open: close,
            high,
            low,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn sma_undefined_before_period_then_trailing_mean() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let out = sma(&values, 4);
        assert!(out[..3].iter().all(Option::is_none));
        for i in 3..values.len() {
            let expected = values[i - 3..=i].iter().sum::<f64>() / 4.0;
            assert!((out[i].unwrap() - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn sma_period_longer_than_series_is_all_none() {
        assert!(sma(&[1.0, 2.0], 3).iter().all(Option::is_none));
        assert!(sma(&[1.0, 2.0], 0).iter().all(Option::is_none));
    }

    #[test]
    fn ema_defined_everywhere_and_recursive() {
        let values = [10.0, 11.0, 9.5, 12.0, 12.5, 11.0];
        let out = ema(&values, 3);
        assert_eq!(out.len(), values.len());
        assert_eq!(out[0], 10.0);
        let alpha = 2.0 / 4.0;
        for i in 1..values.len() {
            let expected = out[i - 1] + alpha * (values[i] - out[i - 1]);
            assert!((out[i] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn true_range_uses_previous_close_gap() {
        let bars = [ohlc(10.0, 9.0, 9.5), ohlc(12.0, 11.5, 11.8)];
        let tr = true_ranges(&bars);
        assert_eq!(tr[0], 1.0);
        // gap up: high - prev close beats high - low
        assert!((tr[1] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn median_atr_ignores_single_gap() {
        let mut bars: Vec<Bar> = (0..14).map(|_| ohlc(101.0, 99.0, 100.0)).collect();
        bars[7] = ohlc(130.0, 99.0, 100.0);
        let med = atr_pct(&bars, 14, AtrMode::Median).unwrap();
        let avg = atr_pct(&bars, 14, AtrMode::Mean).unwrap();
        assert!((med - 2.0).abs() < 1e-9);
        assert!(avg > med);
    }

    #[test]
    fn atr_uses_all_bars_when_short() {
        let bars = [ohlc(11.0, 9.0, 10.0), ohlc(11.0, 9.0, 10.0)];
        assert!((atr_pct(&bars, 14, AtrMode::Median).unwrap() - 20.0).abs() < 1e-9);
        assert!(atr_pct(&[], 14, AtrMode::Median).is_none());
    }

    #[test]
    fn constant_volume_ratio_is_exactly_one() {
        let volumes = vec![5_000.0; 60];
        let vr = volume_ratio(&volumes, 4, 20, 12);
        assert_eq!(vr.rolling, 1.0);
        assert_eq!(vr.peak, 1.0);
        assert_eq!(vr.best(), 1.0);

        // fractional adjusted volumes do not sum exactly
        for v in [0.1, 1_234_567.89] {
            let vr = volume_ratio(&vec![v; 60], 4, 20, 12);
            assert_eq!((vr.rolling, vr.peak), (1.0, 1.0));
        }
    }

    #[test]
    fn zero_long_average_gives_zero_ratios() {
        let vr = volume_ratio(&[0.0; 30], 4, 20, 12);
        assert_eq!(vr.best(), 0.0);
        let short = volume_ratio(&[1.0; 5], 4, 20, 12);
        assert_eq!(short.best(), 0.0);
    }

    #[test]
    fn percentile_rank_counts_strictly_below() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_rank(&values, 3.0), Some(50.0));
        assert_eq!(percentile_rank(&values, 10.0), Some(100.0));
        assert_eq!(percentile_rank(&[], 1.0), None);
    }

    #[test]
    fn nth_back_is_one_based() {
        let v = [1, 2, 3];
        assert_eq!(nth_back(&v, 1), Some(3));
        assert_eq!(nth_back(&v, 3), Some(1));
        assert_eq!(nth_back(&v, 4), None);
        assert_eq!(nth_back(&v, 0), None);
    }
}
