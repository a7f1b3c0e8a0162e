//! Evaluate a ticker as of a past date and measure what happened next.

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::info;

use crate::config::{Criteria, BACKTEST_DAILY_YEARS, BACKTEST_WEEKLY_YEARS, MIN_DAILY_BARS, MIN_WEEKLY_BARS};
use crate::error::{AppError, Result};
use crate::evaluator::{evaluate, TickerContext};
use crate::fetcher::{forward_return, years_before, Fetcher, ForwardReturn};
use crate::types::{Granularity, PriceSeries, ScoredResult};

pub const MAX_FORWARD_WEEKS: u32 = 260;

/// Extra days fetched past the forward target so the closest bar can land after it.
const FORWARD_SLACK_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub ticker: String,
    pub as_of: NaiveDate,
    pub weeks: u32,
    pub result: ScoredResult,
    /// `None` when fewer than two weekly bars exist on or after `as_of`.
    pub forward: Option<ForwardReturn>,
}

/// Fetch history around `as_of`, evaluate without lookahead and attach the forward return.
pub async fn run_backtest(
    fetcher: &Fetcher,
    criteria: &Criteria,
    ctx: &TickerContext,
    ticker: &str,
    as_of: NaiveDate,
    weeks: u32,
) -> Result<BacktestReport> {
    if weeks == 0 || weeks > MAX_FORWARD_WEEKS {
        return Err(AppError::BadRequest(format!(
            "weeks must be between 1 and {MAX_FORWARD_WEEKS}"
        )));
    }
    let end = as_of + Duration::days(i64::from(weeks) * 7 + FORWARD_SLACK_DAYS);

    let (weekly, daily) = tokio::join!(
        fetcher.series_between(
            ticker,
            Granularity::Weekly,
            years_before(as_of, BACKTEST_WEEKLY_YEARS),
            end,
        ),
        fetcher.series_between(
            ticker,
            Granularity::Daily,
            years_before(as_of, BACKTEST_DAILY_YEARS),
            as_of,
        ),
    );

    let report = evaluate_as_of(ticker, &weekly?, &daily?, as_of, weeks, criteria, ctx)?;
    info!(
        event = "BACKTEST",
        ticker,
        as_of = %as_of,
        score = report.result.normalized_score,
        forward_pct = ?report.forward.as_ref().map(|f| f.return_pct),
        "Backtest {ticker} as of {as_of}: score {:.0}",
        report.result.normalized_score,
    );
    Ok(report)
}

/// Pure half of the backtest. Bars after `as_of` are invisible to the evaluator
/// and used only for the forward return.
pub fn evaluate_as_of(
    ticker: &str,
    weekly: &PriceSeries,
    daily: &PriceSeries,
    as_of: NaiveDate,
    weeks: u32,
    criteria: &Criteria,
    ctx: &TickerContext,
) -> Result<BacktestReport> {
    let weekly_cut = weekly.as_of(as_of);
    if weekly_cut.len() < MIN_WEEKLY_BARS {
        return Err(AppError::BadRequest(format!(
            "insufficient weekly history before {as_of}: {} bars",
            weekly_cut.len()
        )));
    }
    let daily_cut = daily.as_of(as_of);
    if daily_cut.len() < MIN_DAILY_BARS {
        return Err(AppError::BadRequest(format!(
            "insufficient daily history before {as_of}: {} bars",
            daily_cut.len()
        )));
    }

    let result = evaluate(ticker, &weekly_cut, &daily_cut, criteria, ctx)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok(BacktestReport {
        ticker: ticker.to_string(),
        as_of,
        weeks,
        result,
        forward: forward_return(weekly, as_of, weeks),
    })
}
