use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror routes.rs shapes; unknown fields are ignored)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct ScanSummary {
    pub scan_id: i64,
    pub mode: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub universe: usize,
    pub evaluated: usize,
    pub skipped_no_data: usize,
    pub skipped_short_history: usize,
    pub skipped_price_floor: usize,
    pub daily_missing: usize,
    pub hits: usize,
    pub full_hits: usize,
    pub strong: usize,
}

/// The `setup` object of a result. Retest and base-breakout metrics share the
/// first fields; the rest are present for one mode only.
#[derive(Debug, Clone, Deserialize)]
pub struct SetupView {
    pub mode: String,
    pub close: f64,
    pub dist_sma200_pct: f64,
    pub vol_ratio: f64,
    pub prior_run_pct: Option<f64>,
    pub correction_pct: Option<f64>,
    pub slope_grade: Option<String>,
    pub subtype: Option<String>,
    pub duration_weeks: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExhaustionView {
    pub stage: String,
    pub dot_days_ago: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyView {
    pub atr_pct: f64,
    pub pct_from_sma50: f64,
    pub exhaustion: ExhaustionView,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructureView {
    pub label: String,
    pub points: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectorView {
    pub name: String,
    pub relative_return_pct: Option<f64>,
    pub points: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct ResultView {
    pub ticker: String,
    pub raw_score: f64,
    pub normalized_score: f64,
    pub category: String,
    pub weekly_pass: bool,
    pub daily_pass: bool,
    pub setup: SetupView,
    pub daily: Option<DailyView>,
    pub structure: StructureView,
    pub sector: SectorView,
    pub signal_summary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistEntry {
    pub ticker: String,
    pub score: f64,
    pub close: f64,
    pub sector: String,
    pub structure_label: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct HealthResponse {
    pub scan_running: bool,
    pub scan_progress: u64,
    pub scan_total: u64,
    pub last_scan_at: Option<i64>,
    pub results_count: i64,
    pub fetch_p99_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub summary: Option<ScanSummary>,
    pub results: Vec<ResultView>,
    pub watchlist: Vec<WatchlistEntry>,
    pub health: HealthResponse,
    /// Result of the last user action (scan trigger, watchlist edit).
    pub flash: Option<String>,
    pub last_refresh: std::time::Instant,
    pub base_url: String,
}

impl AppState {
    pub fn new(base_url: String) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            summary: None,
            results: Vec::new(),
            watchlist: Vec::new(),
            health: HealthResponse::default(),
            flash: None,
            last_refresh: std::time::Instant::now(),
            base_url,
        }
    }

    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let results_url = format!("{}/results?min_score=0&limit=500", self.base_url);
        let summary_url = format!("{}/scans/latest", self.base_url);
        let watchlist_url = format!("{}/watchlist", self.base_url);
        let health_url = format!("{}/health", self.base_url);

        let (results_res, summary_res, watchlist_res, health_res) = tokio::join!(
            client.get(&results_url).send(),
            client.get(&summary_url).send(),
            client.get(&watchlist_url).send(),
            client.get(&health_url).send(),
        );

        let results_resp = match results_res {
            Ok(r) => r,
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("{e}"));
                return;
            }
        };

        match results_resp.json::<Vec<ResultView>>().await {
            Ok(results) => {
                self.results = results;
                self.status = ConnectionStatus::Connected;
                self.last_refresh = std::time::Instant::now();
            }
            Err(e) => {
                self.status = ConnectionStatus::Error(format!("parse error: {e}"));
                return;
            }
        }

        // 404 before the first scan completes
        self.summary = match summary_res {
            Ok(r) if r.status().is_success() => r.json::<ScanSummary>().await.ok(),
            _ => None,
        };
        if let Ok(w) = watchlist_res {
            if let Ok(watchlist) = w.json::<Vec<WatchlistEntry>>().await {
                self.watchlist = watchlist;
            }
        }
        if let Ok(h) = health_res {
            if let Ok(health) = h.json::<HealthResponse>().await {
                self.health = health;
            }
        }
    }

    pub async fn trigger_scan(&mut self, client: &reqwest::Client) {
        let url = format!("{}/scan", self.base_url);
        self.flash = Some(match client.post(&url).send().await {
            Ok(r) if r.status() == reqwest::StatusCode::ACCEPTED => "scan started".to_string(),
            Ok(r) if r.status() == reqwest::StatusCode::CONFLICT => "scan already running".to_string(),
            Ok(r) => format!("scan request failed: {}", r.status()),
            Err(e) => format!("scan request failed: {e}"),
        });
    }

    pub async fn watch(&mut self, client: &reqwest::Client, ticker: &str) {
        let url = format!("{}/watchlist", self.base_url);
        let body = serde_json::json!({ "ticker": ticker });
        self.flash = Some(match client.post(&url).json(&body).send().await {
            Ok(r) if r.status().is_success() => format!("{ticker} added to watchlist"),
            Ok(r) => format!("watch {ticker} failed: {}", r.status()),
            Err(e) => format!("watch {ticker} failed: {e}"),
        });
    }

    pub async fn unwatch(&mut self, client: &reqwest::Client, ticker: &str) {
        let url = format!("{}/watchlist/{}", self.base_url, ticker);
        self.flash = Some(match client.delete(&url).send().await {
            Ok(r) if r.status().is_success() => format!("{ticker} removed from watchlist"),
            Ok(r) => format!("unwatch {ticker} failed: {}", r.status()),
            Err(e) => format!("unwatch {ticker} failed: {e}"),
        });
    }

    pub fn is_watched(&self, ticker: &str) -> bool {
        self.watchlist.iter().any(|w| w.ticker == ticker)
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn format_pct(v: f64) -> String {
    format!("{v:+.1}%")
}

pub fn format_opt_pct(v: Option<f64>) -> String {
    v.map_or("—".to_string(), format_pct)
}

/// Short label for a score category.
pub fn format_category(category: &str) -> &'static str {
    match category {
        "full_hit" => "FULL",
        "strong" => "STRONG",
        "watchlist" => "watch",
        _ => "—",
    }
}

/// "3m ago" style age from unix seconds.
pub fn format_age(then: i64, now: i64) -> String {
    let secs = (now - then).max(0);
    match secs {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_view_reads_both_setup_modes() {
        let retest = serde_json::json!({
            "ticker": "NEM", "raw_score": 100.0, "normalized_score": 80.0, "category": "full_hit",
            "weekly_pass": true, "daily_pass": false, "base_score": 90.0,
            "setup": { "mode": "retest", "close": 40.0, "dist_sma200_pct": 3.2, "vol_ratio": 1.8,
                       "prior_run_pct": 420.0, "correction_pct": 55.0, "slope_grade": "rising" },
            "daily": null,
            "structure": { "label": "MA Stack", "points": 15, "kind": "ma_stack" },
            "sector": { "name": "Materials", "etf": "XLB", "relative_return_pct": 6.1, "points": 5 },
            "signal_summary": "SMA ↑ · MA stack"
        });
        let r: ResultView = serde_json::from_value(retest).unwrap();
        assert_eq!(r.setup.slope_grade.as_deref(), Some("rising"));
        assert!(r.setup.subtype.is_none());

        let base = serde_json::json!({
            "mode": "base_breakout", "close": 12.0, "dist_sma200_pct": 20.0, "vol_ratio": 2.5,
            "subtype": "commodity", "duration_weeks": 120
        });
        let s: SetupView = serde_json::from_value(base).unwrap();
        assert_eq!(s.subtype.as_deref(), Some("commodity"));
        assert!(s.prior_run_pct.is_none());
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(format_pct(3.27), "+3.3%");
        assert_eq!(format_pct(-12.0), "-12.0%");
        assert_eq!(format_opt_pct(None), "—");
        assert_eq!(format_category("strong"), "STRONG");
        assert_eq!(format_age(100, 130), "30s ago");
        assert_eq!(format_age(0, 7_200), "2h ago");
        assert_eq!(truncate("Consumer Defensive", 8), "Consume…");
        assert_eq!(truncate("MA · Stack", 20), "MA · Stack");
    }
}
