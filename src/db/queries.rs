use sqlx::SqlitePool;

use crate::db::models::{ResultRow, ScanRow, WatchlistRow};
use crate::error::Result;
use crate::types::{
    CompletedScan, ScanMode, ScanSummary, ScoreCategory, ScoredResult, SetupMetrics, SlopeGrade,
    WatchlistEntry,
};

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// Open a scan row and return its id. The writer completes it later.
pub async fn insert_scan(
    pool: &SqlitePool,
    mode: ScanMode,
    started_at: i64,
    universe: usize,
) -> Result<i64> {
    let id = sqlx::query("INSERT INTO scans (mode, started_at, universe) VALUES (?, ?, ?)")
        .bind(mode.to_string())
        .bind(started_at)
        .bind(universe as i64)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Store the summary and every result of a finished scan in one transaction.
pub async fn complete_scan(pool: &SqlitePool, scan: &CompletedScan) -> Result<()> {
    let summary = &scan.summary;
    let summary_json = serde_json::to_string(summary)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE scans
        SET finished_at = ?, evaluated = ?, hits = ?, summary_json = ?
        WHERE id = ?
        "#,
    )
    .bind(summary.finished_at)
    .bind(summary.evaluated as i64)
    .bind(summary.hits as i64)
    .bind(&summary_json)
    .bind(summary.scan_id)
    .execute(&mut *tx)
    .await?;

    for r in &scan.results {
        let result_json = serde_json::to_string(r)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO results (
                scan_id, ticker, mode, normalized_score, raw_score, category,
                weekly_pass, daily_pass, close, sector, structure_label,
                signal_summary, result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.scan_id)
        .bind(&r.ticker)
        .bind(r.mode.to_string())
        .bind(r.normalized_score)
        .bind(r.raw_score)
        .bind(r.category.to_string())
        .bind(r.weekly_pass)
        .bind(r.daily_pass)
        .bind(r.setup.close())
        .bind(&r.sector.name)
        .bind(&r.structure.label)
        .bind(&r.signal_summary)
        .bind(&result_json)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Summary of the most recent finished scan.
pub async fn latest_summary(pool: &SqlitePool) -> Result<Option<ScanSummary>> {
    let row = sqlx::query_as::<_, ScanRow>(
        r#"
        SELECT id, mode, started_at, finished_at, summary_json
        FROM scans
        WHERE finished_at IS NOT NULL AND summary_json IS NOT NULL
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    match row.and_then(|r| r.summary_json) {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Recent scans, newest first, without their results.
pub async fn recent_scans(pool: &SqlitePool, limit: i64) -> Result<Vec<ScanRow>> {
    let rows = sqlx::query_as::<_, ScanRow>(
        r#"
        SELECT id, mode, started_at, finished_at, summary_json
        FROM scans
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

const LATEST_SCAN_ID: &str =
    "(SELECT MAX(id) FROM scans WHERE finished_at IS NOT NULL)";

fn decode(rows: Vec<ResultRow>) -> Result<Vec<ScoredResult>> {
    rows.into_iter()
        .map(|r| Ok(serde_json::from_str(&r.result_json)?))
        .collect()
}

/// Results of the latest finished scan, highest normalized score first.
pub async fn latest_results(
    pool: &SqlitePool,
    min_score: f64,
    category: Option<ScoreCategory>,
    limit: i64,
) -> Result<Vec<ScoredResult>> {
    let sql = format!(
        r#"
        SELECT result_json
        FROM results
        WHERE scan_id = {LATEST_SCAN_ID}
          AND normalized_score >= ?
          AND (? IS NULL OR category = ?)
        ORDER BY normalized_score DESC, ticker ASC
        LIMIT ?
        "#
    );
    let category = category.map(|c| c.to_string());
    let rows = sqlx::query_as::<_, ResultRow>(&sql)
        .bind(min_score)
        .bind(&category)
        .bind(&category)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    decode(rows)
}

/// A ticker's result from the most recent scan that evaluated it.
pub async fn latest_result_for(pool: &SqlitePool, ticker: &str) -> Result<Option<ScoredResult>> {
    let row = sqlx::query_as::<_, ResultRow>(
        r#"
        SELECT result_json
        FROM results
        WHERE ticker = ?
        ORDER BY scan_id DESC
        LIMIT 1
        "#,
    )
    .bind(ticker.to_ascii_uppercase())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) => Ok(Some(serde_json::from_str(&r.result_json)?)),
        None => Ok(None),
    }
}

pub async fn latest_results_count(pool: &SqlitePool) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM results WHERE scan_id = {LATEST_SCAN_ID}");
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Watchlist
// ---------------------------------------------------------------------------

impl WatchlistEntry {
    pub fn from_result(r: &ScoredResult, added_at: i64) -> Self {
        let slope_grade = match &r.setup {
            SetupMetrics::Retest(w) => Some(w.slope_grade),
            SetupMetrics::BaseBreakout(_) => None,
        };
        Self {
            ticker: r.ticker.clone(),
            score: r.normalized_score,
            close: r.setup.close(),
            sector: r.sector.name.clone(),
            structure_label: r.structure.label.clone(),
            slope_grade,
            added_at,
        }
    }
}

fn parse_slope_grade(raw: &str) -> Option<SlopeGrade> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}

pub async fn list_watchlist(pool: &SqlitePool) -> Result<Vec<WatchlistEntry>> {
    let rows = sqlx::query_as::<_, WatchlistRow>(
        r#"
        SELECT ticker, score, close, sector, structure_label, slope_grade, added_at
        FROM watchlist
        ORDER BY score DESC, ticker ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| WatchlistEntry {
            slope_grade: r.slope_grade.as_deref().and_then(parse_slope_grade),
            ticker: r.ticker,
            score: r.score,
            close: r.close,
            sector: r.sector,
            structure_label: r.structure_label,
            added_at: r.added_at,
        })
        .collect())
}

/// Insert or refresh a watchlist entry.
pub async fn upsert_watchlist(pool: &SqlitePool, entry: &WatchlistEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO watchlist (ticker, score, close, sector, structure_label, slope_grade, added_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ticker) DO UPDATE SET
            score = excluded.score,
            close = excluded.close,
            sector = excluded.sector,
            structure_label = excluded.structure_label,
            slope_grade = excluded.slope_grade
        "#,
    )
    .bind(&entry.ticker)
    .bind(entry.score)
    .bind(entry.close)
    .bind(&entry.sector)
    .bind(&entry.structure_label)
    .bind(entry.slope_grade.map(|g| g.to_string()))
    .bind(entry.added_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// True when a row was removed.
pub async fn remove_watchlist(pool: &SqlitePool, ticker: &str) -> Result<bool> {
    let affected = sqlx::query("DELETE FROM watchlist WHERE ticker = ?")
        .bind(ticker.to_ascii_uppercase())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected > 0)
}


#[cfg(test)]
mod tests {
    use super::test_support::{memory_pool, result};
    use super::*;

    async fn seed_scan(pool: &SqlitePool, started_at: i64, results: Vec<ScoredResult>) -> i64 {
        let id = insert_scan(pool, ScanMode::Retest, started_at, results.len()).await.unwrap();
        let summary = ScanSummary {
            scan_id: id,
            mode: Some(ScanMode::Retest),
            started_at,
            finished_at: Some(started_at + 60),
            universe: results.len(),
            evaluated: results.len(),
            ..ScanSummary::default()
        };
        complete_scan(pool, &CompletedScan { summary, results }).await.unwrap();
        id
    }

    #[tokio::test]
    async fn unfinished_scan_is_not_latest() {
        let pool = memory_pool().await;
        assert!(latest_summary(&pool).await.unwrap().is_none());

        let first = seed_scan(&pool, 1_000, vec![result("AAA", 70.0)]).await;
        insert_scan(&pool, ScanMode::Retest, 2_000, 10).await.unwrap();

        let summary = latest_summary(&pool).await.unwrap().unwrap();
        assert_eq!(summary.scan_id, first);
        assert_eq!(latest_results_count(&pool).await.unwrap(), 1);
        assert_eq!(recent_scans(&pool, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn latest_results_are_ranked_and_filtered() {
        let pool = memory_pool().await;
        seed_scan(&pool, 1_000, vec![result("OLD", 99.0)]).await;
        seed_scan(
            &pool,
            2_000,
            vec![result("LOW", 40.0), result("MID", 65.0), result("TOP", 85.0)],
        )
        .await;

        let all = latest_results(&pool, 0.0, None, 100).await.unwrap();
        let tickers: Vec<&str> = all.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["TOP", "MID", "LOW"]);

        let hits = latest_results(&pool, 60.0, None, 100).await.unwrap();
        assert_eq!(hits.len(), 2);

        let strong = latest_results(&pool, 0.0, Some(ScoreCategory::Strong), 100).await.unwrap();
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].ticker, "MID");

        assert_eq!(latest_results(&pool, 0.0, None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn result_for_ticker_comes_from_its_newest_scan() {
        let pool = memory_pool().await;
        seed_scan(&pool, 1_000, vec![result("NEM", 50.0)]).await;
        seed_scan(&pool, 2_000, vec![result("NEM", 72.0)]).await;

        let r = latest_result_for(&pool, "nem").await.unwrap().unwrap();
        assert_eq!(r.normalized_score, 72.0);
        assert_eq!(r.structure.label, "EMA Bounce");
        assert!(latest_result_for(&pool, "ZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watchlist_upsert_keeps_added_at() {
        let pool = memory_pool().await;
        let mut entry = WatchlistEntry::from_result(&result("XOM", 70.0), 100);
        assert_eq!(entry.slope_grade, Some(SlopeGrade::Declining));
        upsert_watchlist(&pool, &entry).await.unwrap();

        entry.score = 81.0;
        entry.added_at = 200;
        upsert_watchlist(&pool, &entry).await.unwrap();

        let list = list_watchlist(&pool).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].score, 81.0);
        assert_eq!(list[0].added_at, 100);
        assert_eq!(list[0].slope_grade, Some(SlopeGrade::Declining));

        assert!(remove_watchlist(&pool, "xom").await.unwrap());
        assert!(!remove_watchlist(&pool, "XOM").await.unwrap());
        assert!(list_watchlist(&pool).await.unwrap().is_empty());
    }
}
