use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::api::health::HealthState;
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::backtest::{run_backtest, BacktestReport};
use crate::config::Criteria;
use crate::db::queries;
use crate::error::{AppError, Result};
use crate::fetcher::{FetchStats, Fetcher};
use crate::sector::SectorBook;
use crate::types::{ScanSummary, ScoreCategory, ScoredResult, SetupMetrics, WatchlistEntry};

#[derive(Clone)]
pub struct ApiState {
    pub pool: sqlx::SqlitePool,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub fetcher: Arc<Fetcher>,
    pub criteria: Arc<Criteria>,
    pub sectors: Arc<SectorBook>,
    pub trigger_tx: mpsc::Sender<()>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/scans", get(get_scans))
        .route("/scans/latest", get(get_latest_scan))
        .route("/results", get(get_results))
        .route("/results.csv", get(get_results_csv))
        .route("/results/:ticker", get(get_result))
        .route("/watchlist", get(get_watchlist).post(add_watchlist))
        .route("/watchlist/:ticker", delete(remove_watchlist))
        .route("/scan", post(trigger_scan))
        .route("/backtest/:ticker", get(get_backtest))
        .route("/stats/latency", get(get_stats_latency))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ResultsQuery {
    /// Defaults to the display threshold, so the plain call lists hits.
    pub min_score: Option<f64>,
    pub category: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ScansQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct WatchlistAdd {
    pub ticker: String,
}

#[derive(Deserialize)]
pub struct BacktestQuery {
    pub date: NaiveDate,
    pub weeks: Option<u32>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scan_running: bool,
    pub scan_progress: u64,
    pub scan_total: u64,
    pub last_scan_at: Option<i64>,
    pub last_scan_id: Option<i64>,
    pub results_count: i64,
    pub write_queue_pending: u64,
    pub fetch_p99_ms: Option<f64>,
}

#[derive(Serialize)]
pub struct ScanListItem {
    pub id: i64,
    pub mode: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Serialize)]
pub struct ScanAccepted {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub fetch: LatencySummary,
    /// Counters for the current or most recent scan.
    pub last_scan: FetchStats,
}

/// One CSV line per result. Column names are the header row.
#[derive(Serialize)]
struct CsvRow<'a> {
    ticker: &'a str,
    mode: String,
    normalized_score: f64,
    raw_score: f64,
    category: String,
    weekly_pass: bool,
    daily_pass: bool,
    close: f64,
    dist_sma200_pct: f64,
    vol_ratio: f64,
    prior_run_pct: Option<f64>,
    correction_pct: Option<f64>,
    slope_grade: Option<String>,
    base_subtype: Option<String>,
    atr_pct: Option<f64>,
    exhaustion_stage: Option<String>,
    structure: &'a str,
    sector: &'a str,
    sector_rel_pct: Option<f64>,
    signal_summary: &'a str,
}

impl<'a> CsvRow<'a> {
    fn from_result(r: &'a ScoredResult) -> Self {
        let (prior_run_pct, correction_pct, slope_grade, base_subtype) = match &r.setup {
            SetupMetrics::Retest(w) => (
                Some(w.prior_run_pct),
                Some(w.correction_pct),
                Some(w.slope_grade.to_string()),
                None,
            ),
            SetupMetrics::BaseBreakout(b) => (None, None, None, Some(b.subtype.to_string())),
        };
        Self {
            ticker: &r.ticker,
            mode: r.mode.to_string(),
            normalized_score: r.normalized_score,
            raw_score: r.raw_score,
            category: r.category.to_string(),
            weekly_pass: r.weekly_pass,
            daily_pass: r.daily_pass,
            close: r.setup.close(),
            dist_sma200_pct: r.setup.dist_sma200_pct(),
            vol_ratio: r.setup.vol_ratio(),
            prior_run_pct,
            correction_pct,
            slope_grade,
            base_subtype,
            atr_pct: r.daily.as_ref().map(|d| d.atr_pct),
            exhaustion_stage: r.daily.as_ref().map(|d| d.exhaustion.stage.to_string()),
            structure: &r.structure.label,
            sector: &r.sector.name,
            sector_rel_pct: r.sector.relative_return_pct,
            signal_summary: &r.signal_summary,
        }
    }
}

/// Header plus one row per result, in the given order.
pub fn results_csv(results: &[ScoredResult]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    if results.is_empty() {
        // serialize() writes the header lazily; emit it for empty exports too
        wtr.write_record(CSV_HEADER)?;
    }
    for r in results {
        wtr.serialize(CsvRow::from_result(r))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| AppError::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| AppError::Data(e.to_string()))
}

const CSV_HEADER: &[&str] = &[
    "ticker",
    "mode",
    "normalized_score",
    "raw_score",
    "category",
    "weekly_pass",
    "daily_pass",
    "close",
    "dist_sma200_pct",
    "vol_ratio",
    "prior_run_pct",
    "correction_pct",
    "slope_grade",
    "base_subtype",
    "atr_pct",
    "exhaustion_stage",
    "structure",
    "sector",
    "sector_rel_pct",
    "signal_summary",
];

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>> {
    let results_count = queries::latest_results_count(&state.pool).await?;
    let (scan_progress, scan_total) = state.health.scan_progress();
    let last_scan_at = state.health.last_scan_at();
    let last_scan_id = state.health.last_scan_id();

    Ok(Json(HealthResponse {
        status: "ok",
        scan_running: state.health.scan_running(),
        scan_progress,
        scan_total,
        last_scan_at: (last_scan_at > 0).then_some(last_scan_at),
        last_scan_id: (last_scan_id > 0).then_some(last_scan_id),
        results_count,
        write_queue_pending: state.health.write_queue_pending(),
        fetch_p99_ms: state.latency.summary().p99_ms,
    }))
}

async fn get_scans(
    State(state): State<ApiState>,
    Query(params): Query<ScansQuery>,
) -> Result<Json<Vec<ScanListItem>>> {
    let rows = queries::recent_scans(&state.pool, params.limit.unwrap_or(20)).await?;
    Ok(Json(
        rows.into_iter()
            .map(|r| ScanListItem {
                id: r.id,
                mode: r.mode,
                started_at: r.started_at,
                finished_at: r.finished_at,
            })
            .collect(),
    ))
}

async fn get_latest_scan(State(state): State<ApiState>) -> Result<Json<ScanSummary>> {
    queries::latest_summary(&state.pool)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no completed scan yet".to_string()))
}

async fn load_results(state: &ApiState, params: &ResultsQuery) -> Result<Vec<ScoredResult>> {
    let category = params
        .category
        .as_deref()
        .map(str::parse::<ScoreCategory>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let min_score = params.min_score.unwrap_or(state.criteria.min_display_score);
    let limit = params.limit.unwrap_or(500).clamp(1, 10_000);
    queries::latest_results(&state.pool, min_score, category, limit).await
}

async fn get_results(
    State(state): State<ApiState>,
    Query(params): Query<ResultsQuery>,
) -> Result<Json<Vec<ScoredResult>>> {
    Ok(Json(load_results(&state, &params).await?))
}

async fn get_results_csv(
    State(state): State<ApiState>,
    Query(params): Query<ResultsQuery>,
) -> Result<impl IntoResponse> {
    let results = load_results(&state, &params).await?;
    let body = results_csv(&results)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"scan_results.csv\""),
        ],
        body,
    ))
}

async fn get_result(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
) -> Result<Json<ScoredResult>> {
    queries::latest_result_for(&state.pool, &ticker)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no result for {ticker}")))
}

async fn get_watchlist(State(state): State<ApiState>) -> Result<Json<Vec<WatchlistEntry>>> {
    Ok(Json(queries::list_watchlist(&state.pool).await?))
}

async fn add_watchlist(
    State(state): State<ApiState>,
    Json(body): Json<WatchlistAdd>,
) -> Result<(StatusCode, Json<WatchlistEntry>)> {
    let ticker = body.ticker.trim().to_ascii_uppercase();
    if ticker.is_empty() {
        return Err(AppError::BadRequest("ticker is required".to_string()));
    }
    let result = queries::latest_result_for(&state.pool, &ticker)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{ticker} has no scan result to watch")))?;
    let entry = WatchlistEntry::from_result(&result, Utc::now().timestamp());
    queries::upsert_watchlist(&state.pool, &entry).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn remove_watchlist(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
) -> Result<StatusCode> {
    if queries::remove_watchlist(&state.pool, &ticker).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("{ticker} is not on the watchlist")))
    }
}

async fn trigger_scan(State(state): State<ApiState>) -> Result<(StatusCode, Json<ScanAccepted>)> {
    if state.health.scan_running() {
        return Err(AppError::Conflict("a scan is already running".to_string()));
    }
    match state.trigger_tx.try_send(()) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(ScanAccepted { status: "started" }))),
        Err(TrySendError::Full(())) => Err(AppError::Conflict("a scan is already queued".to_string())),
        Err(TrySendError::Closed(())) => Err(AppError::Config("scanner is not running".to_string())),
    }
}

async fn get_backtest(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
    Query(params): Query<BacktestQuery>,
) -> Result<Json<BacktestReport>> {
    let ticker = ticker.to_ascii_uppercase();
    if params.date > Utc::now().date_naive() {
        return Err(AppError::BadRequest("date is in the future".to_string()));
    }
    let sector = state.sectors.resolve(&state.fetcher, &ticker).await;
    let ctx = state.sectors.context_for(&ticker, sector);
    let report = run_backtest(
        &state.fetcher,
        &state.criteria,
        &ctx,
        &ticker,
        params.date,
        params.weeks.unwrap_or(12),
    )
    .await?;
    Ok(Json(report))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    Json(LatencyResponse {
        fetch: state.latency.summary(),
        last_scan: state.fetcher.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::test_support::result;

    #[test]
    fn csv_has_one_header_and_one_row_per_result() {
        let results = vec![result("AAA", 82.0), result("BBB", 61.0)];
        let csv = results_csv(&results).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ticker,mode,normalized_score"));
        assert_eq!(lines[0].split(',').count(), CSV_HEADER.len());
        assert!(lines[1].starts_with("AAA,retest,82.0"));
        assert!(lines[1].contains("full_hit"));
        assert!(lines[2].contains("EMA Bounce"));
    }

    #[test]
    fn empty_csv_still_has_header() {
        let csv = results_csv(&[]).unwrap();
        assert_eq!(csv.lines().count(), 1);
        assert_eq!(csv.trim_end(), CSV_HEADER.join(","));
    }
}
