use crate::config::{DailyGateWeights, ScoringWeights};
use crate::types::{BaseBreakoutMetrics, BaseSubtype, DailyMetrics, SlopeGrade, WeeklyMetrics};

fn daily_gate_points(daily: Option<&DailyMetrics>, w: &DailyGateWeights) -> f64 {
    let Some(d) = daily else {
        return 0.0;
    };
    [
        (d.pass_atr, w.atr),
        (d.pass_50sma, w.sma50),
        (d.pass_ema_cross, w.ema_cross),
        (d.pass_candle, w.candle),
    ]
    .iter()
    .filter(|(hit, _)| *hit)
    .map(|(_, pts)| pts)
    .sum()
}

/// Retest-mode setup score: proportional run, correction and volume, proximity,
/// slope grade, daily gates and the weekly bonus signals. Rounded to whole points.
pub fn score_setup(
    weekly: &WeeklyMetrics,
    daily: Option<&DailyMetrics>,
    weights: &ScoringWeights,
) -> f64 {
    let s = &weights.setup;
    let b = &weights.bonus;

    let mut pts = s.prior_run.points(weekly.prior_run_pct)
        + s.correction.points(weekly.correction_pct)
        + s.volume.points(weekly.vol_ratio);

    if weekly.pass_sma_proximity {
        pts += s.proximity;
    } else if weekly.dist_sma200_pct.abs() <= s.proximity_near_pct {
        pts += s.proximity_near;
    }

    pts += match weekly.slope_grade {
        SlopeGrade::Rising => s.slope_rising,
        SlopeGrade::Flattening => s.slope_flattening,
        SlopeGrade::Declining => 0.0,
    };

    pts += daily_gate_points(daily, &weights.daily);

    if weekly.resistance_flip {
        pts += b.resistance_flip;
    }
    if let Some(weeks) = weekly.undercut_weeks_ago.filter(|_| weekly.undercut_reclaim) {
        pts += if weeks <= b.undercut_recent_weeks { b.undercut_recent } else { b.undercut_older };
    }
    if weekly.multiyear_vol_high {
        pts += b.multiyear_volume;
    }

    pts.round()
}

/// Base-breakout score with subtype weights. Growth bases also earn the
/// daily exhaustion stage points.
pub fn score_base_breakout(
    base: &BaseBreakoutMetrics,
    daily: Option<&DailyMetrics>,
    weights: &ScoringWeights,
) -> f64 {
    let w = match base.subtype {
        BaseSubtype::Growth => &weights.growth_base,
        BaseSubtype::Commodity => &weights.commodity_base,
    };

    let mut pts: f64 = [
        (base.pass_sma_proximity, w.sma_proximity),
        (base.pass_range, w.range),
        (base.pass_atr, w.atr),
        (base.pass_volume_surge, w.volume),
        (base.pass_duration, w.duration),
        (base.pass_slope, w.slope),
    ]
    .iter()
    .filter(|(hit, _)| *hit)
    .map(|(_, pts)| pts)
    .sum();

    pts += daily_gate_points(daily, &weights.daily);

    if base.subtype == BaseSubtype::Growth {
        pts += daily.map_or(0, |d| d.exhaustion.points) as f64;
    }

    pts.round()
}
