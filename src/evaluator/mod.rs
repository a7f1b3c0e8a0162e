//! Per-ticker evaluation. Everything under here is pure and synchronous:
//! one ticker's series in, one `ScoredResult` out, no shared state.

pub mod base_breakout;
pub mod daily;
pub mod structure;
pub mod weekly;

use tracing::debug;

use crate::config::Criteria;
use crate::error::EvalError;
use crate::scorer;
use crate::types::{
    PriceSeries, RecoveryStructure, ScanMode, ScoreCategory, ScoredResult, SectorSnapshot,
    SetupMetrics,
};

pub use base_breakout::check_base_breakout;
pub use daily::check_daily;
pub use structure::classify_structure;
pub use weekly::check_weekly;

/// Per-ticker facts that come from outside the price series.
#[derive(Debug, Clone)]
pub struct TickerContext {
    pub is_adr: bool,
    /// Sector-aware prior-run floor. `None` uses the configured floor alone.
    pub run_threshold: Option<f64>,
    pub sector: SectorSnapshot,
}

impl Default for TickerContext {
    fn default() -> Self {
        Self {
            is_adr: false,
            run_threshold: None,
            sector: SectorSnapshot::unknown(),
        }
    }
}

/// Evaluate one ticker under `criteria.mode`.
///
/// Weekly history below the evaluator floor is an error. A missing or short
/// daily series is not: the result carries `daily: None` and earns no daily points.
pub fn evaluate(
    ticker: &str,
    weekly: &PriceSeries,
    daily: &PriceSeries,
    criteria: &Criteria,
    ctx: &TickerContext,
) -> Result<ScoredResult, EvalError> {
    let weights = &criteria.weights;

    let daily_verdict = match check_daily(daily, &criteria.daily, &weights.exhaustion) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(ticker, "daily evaluation skipped: {e}");
            None
        }
    };
    let daily_metrics = daily_verdict.as_ref().map(|v| &v.metrics);
    let daily_pass = daily_verdict.as_ref().is_some_and(|v| v.pass);

    let (setup, weekly_pass, base_score, structure) = match criteria.mode {
        ScanMode::Retest => {
            let verdict = check_weekly(weekly, &criteria.weekly, ctx)?;
            let structure = classify_structure(weekly, &weights.structure)?;
            let score = scorer::score_setup(&verdict.metrics, daily_metrics, weights);
            (SetupMetrics::Retest(verdict.metrics), verdict.pass, score, structure)
        }
        ScanMode::BaseBreakout => {
            let verdict = check_base_breakout(weekly, &criteria.base)?;
            let score = scorer::score_base_breakout(&verdict.metrics, daily_metrics, weights);
            (
                SetupMetrics::BaseBreakout(verdict.metrics),
                verdict.pass,
                score,
                RecoveryStructure::not_applicable(),
            )
        }
    };

    let raw_score = scorer::apply_adjustments(base_score, structure.points, ctx.sector.points);
    let normalized_score = scorer::normalize(raw_score, criteria.score_scale);
    let signal_summary = scorer::signal_summary(&setup, daily_metrics, &structure);

    Ok(ScoredResult {
        ticker: ticker.to_string(),
        mode: criteria.mode,
        base_score,
        bonus_score: raw_score - base_score,
        raw_score,
        normalized_score,
        category: ScoreCategory::from_normalized(normalized_score),
        weekly_pass,
        daily_pass,
        setup,
        daily: daily_verdict.map(|v| v.metrics),
        structure,
        sector: ctx.sector.clone(),
        signal_summary,
        as_of: weekly.last().map(|b| b.date),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{daily_bars, series_from, weekly_bars};
    use super::*;
    use crate::types::{PriceSeries, StructureKind};

    fn retest_weekly() -> PriceSeries {
        let mut closes: Vec<f64> = (0..=150).map(|i| 10.0 + i as f64 / 5.0).collect();
        closes.extend((1..=50).map(|k| 40.0 - (2 * k) as f64 / 5.0));
        closes.extend(std::iter::repeat(20.0).take(19));
        let mut vols = vec![1000.0; closes.len()];
        *vols.last_mut().unwrap() = 2000.0;
        series_from(weekly_bars(&closes, &vols))
    }

    #[test]
    fn short_weekly_history_fails_the_ticker() {
        let weekly = series_from(weekly_bars(&[20.0; 40], &[1000.0; 40]));
        let err = evaluate("ABC", &weekly, &PriceSeries::default(), &Criteria::default(), &TickerContext::default())
            .unwrap_err();
        assert!(matches!(err, EvalError::InsufficientHistory { have: 40, .. }));
    }

    #[test]
    fn missing_daily_still_scores_weekly() {
        let result = evaluate(
            "ABC",
            &retest_weekly(),
            &PriceSeries::default(),
            &Criteria::default(),
            &TickerContext::default(),
        )
        .unwrap();
        assert!(result.daily.is_none());
        assert!(!result.daily_pass);
        assert!(result.weekly_pass);
        assert!(result.base_score > 0.0);
        assert_eq!(result.raw_score, result.base_score + result.structure.points as f64);
    }

    #[test]
    fn sector_points_flow_into_raw_and_bonus() {
        let weekly = retest_weekly();
        let daily = series_from(daily_bars(&[20.0; 80], &[1000.0; 80]));
        let mut ctx = TickerContext::default();
        let plain = evaluate("ABC", &weekly, &daily, &Criteria::default(), &ctx).unwrap();

        ctx.sector.points = 10;
        let boosted = evaluate("ABC", &weekly, &daily, &Criteria::default(), &ctx).unwrap();
        assert_eq!(boosted.raw_score, plain.raw_score + 10.0);
        assert_eq!(boosted.base_score, plain.base_score);
        assert_eq!(boosted.bonus_score, plain.bonus_score + 10.0);
        assert!(boosted.normalized_score >= plain.normalized_score);
    }

    #[test]
    fn base_breakout_mode_skips_structure() {
        let closes = vec![20.0; 200];
        let weekly = series_from(weekly_bars(&closes, &vec![1000.0; 200]));
        let criteria = Criteria { mode: ScanMode::BaseBreakout, ..Criteria::default() };
        let result =
            evaluate("ABC", &weekly, &PriceSeries::default(), &criteria, &TickerContext::default()).unwrap();
        assert_eq!(result.structure.kind, StructureKind::None);
        assert!(matches!(result.setup, SetupMetrics::BaseBreakout(_)));
        assert_eq!(result.mode, ScanMode::BaseBreakout);
    }

    #[test]
    fn category_follows_normalized_score() {
        let result = evaluate(
            "ABC",
            &retest_weekly(),
            &PriceSeries::default(),
            &Criteria::default(),
            &TickerContext::default(),
        )
        .unwrap();
        assert_eq!(result.category, ScoreCategory::from_normalized(result.normalized_score));
        assert!(result.normalized_score <= 100.0);
    }
}
