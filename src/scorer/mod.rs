//! Turns evaluator metrics into points. Weights come from `ScoringWeights`;
//! nothing here reads a series.

mod setup;
mod summary;

pub use setup::{score_base_breakout, score_setup};
pub use summary::signal_summary;

use crate::config::SectorPoints;

/// Structure then sector, each floored at zero.
pub fn apply_adjustments(base: f64, structure_points: i32, sector_points: i32) -> f64 {
    let raw = (base + structure_points as f64).max(0.0);
    (raw + sector_points as f64).max(0.0)
}

/// Raw points to 0..=100 against the canonical scale.
pub fn normalize(raw: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    (raw / scale * 100.0).round().min(100.0)
}

/// Bucket a sector ETF's return relative to the benchmark, in percentage points.
pub fn sector_points(relative_return_pct: f64, p: &SectorPoints) -> i32 {
    if relative_return_pct >= p.strong_min_pct {
        p.strong
    } else if relative_return_pct >= p.positive_min_pct {
        p.positive
    } else if relative_return_pct >= p.neutral_min_pct {
        0
    } else {
        p.lagging
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::types::{
        BaseBreakoutMetrics, BaseSubtype, DailyMetrics, Exhaustion, SlopeGrade, WeeklyMetrics,
    };

    /// Weekly metrics with every gate and bonus off.
    pub fn weekly() -> WeeklyMetrics {
        WeeklyMetrics {
            close: 20.0,
            sma200: 20.0,
            sma_period: 200,
            dist_sma200_pct: 0.0,
            window_high: 40.0,
            window_low: 10.0,
            prior_run_pct: 0.0,
            correction_pct: 0.0,
            vol_ratio: 1.0,
            vol_ratio_rolling: 1.0,
            vol_ratio_peak: 1.0,
            slope_pct: -1.0,
            slope_accel: 0.0,
            slope_grade: SlopeGrade::Declining,
            run_threshold: 300.0,
            pass_sma_proximity: false,
            pass_prior_run: false,
            pass_correction: false,
            pass_volume_surge: false,
            undercut_reclaim: false,
            undercut_weeks_ago: None,
            multiyear_vol_high: false,
            vol_rank_pct: 0.0,
            resistance_flip: false,
            resistance_level: None,
            is_adr: false,
            adr_vol_pct_rank: None,
        }
    }

    /// Daily metrics with all four gates passing and no exhaustion signal.
    pub fn daily() -> DailyMetrics {
        DailyMetrics {
            close: 20.0,
            atr_pct: 5.0,
            sma50: 19.0,
            pct_from_sma50: 5.0,
            ema10: 19.5,
            ema20: 19.2,
            ema_spread_pct: 1.5,
            candle_position: 0.8,
            sma50_slope_pct: 1.0,
            sma50_rising: true,
            atr_mult_from_sma50: 1.0,
            exhaustion: Exhaustion::quiet(),
            pass_atr: true,
            pass_50sma: true,
            pass_ema_cross: true,
            pass_candle: true,
        }
    }

    /// Base metrics with every gate passing.
    pub fn base(subtype: BaseSubtype) -> BaseBreakoutMetrics {
        BaseBreakoutMetrics {
            close: 20.0,
            sma200: 19.0,
            dist_sma200_pct: 5.3,
            base_weeks: 104,
            base_high: 21.0,
            base_low: 18.0,
            range_pct: 16.7,
            base_atr_pct: 3.0,
            vol_ratio: 2.5,
            duration_weeks: 120,
            sma_slope: 0.1,
            ema10: 19.8,
            ema20: 19.5,
            sma50: 19.2,
            ma_alignment: 4,
            subtype,
            pass_sma_proximity: true,
            pass_range: true,
            pass_atr: true,
            pass_volume_surge: true,
            pass_duration: true,
            pass_slope: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustments_floor_at_zero_in_two_steps() {
        assert_eq!(apply_adjustments(50.0, 15, 10), 75.0);
        assert_eq!(apply_adjustments(3.0, 0, -5), 0.0);
        // structure cannot go negative, so only the sector step can floor
        assert_eq!(apply_adjustments(0.0, 0, -5), 0.0);
        assert_eq!(apply_adjustments(2.0, 8, -5), 5.0);
    }

    #[test]
    fn normalize_rounds_and_caps() {
        assert_eq!(normalize(100.0, 125.0), 80.0);
        assert_eq!(normalize(75.0, 125.0), 60.0);
        assert_eq!(normalize(74.0, 125.0), 59.0);
        assert_eq!(normalize(140.0, 125.0), 100.0);
        assert_eq!(normalize(10.0, 0.0), 0.0);
    }

    #[test]
    fn sector_buckets_at_boundaries() {
        let p = SectorPoints::default();
        assert_eq!(sector_points(15.0, &p), 10);
        assert_eq!(sector_points(14.99, &p), 5);
        assert_eq!(sector_points(5.0, &p), 5);
        assert_eq!(sector_points(4.99, &p), 0);
        assert_eq!(sector_points(-5.0, &p), 0);
        assert_eq!(sector_points(-5.01, &p), -5);
    }
}
