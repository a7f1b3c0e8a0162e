/// Database row types matching migrations/0001_init.sql.
/// Used with `sqlx::query_as` for typed reads.

#[derive(Debug, sqlx::FromRow)]
pub struct ScanRow {
    pub id: i64,
    pub mode: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub summary_json: Option<String>,
}

/// Full `ScoredResult` as stored. The other `results` columns exist for
/// filtering and ordering in SQL.
#[derive(Debug, sqlx::FromRow)]
pub struct ResultRow {
    pub result_json: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct WatchlistRow {
    pub ticker: String,
    pub score: f64,
    pub close: f64,
    pub sector: String,
    pub structure_label: String,
    pub slope_grade: Option<String>,
    pub added_at: i64,
}
