mod api;
mod backtest;
mod config;
mod db;
mod error;
mod evaluator;
mod fetcher;
mod indicators;
mod scan;
mod scorer;
mod sector;
mod snapshot;
mod state;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::ResultWriter;
use crate::error::Result;
use crate::fetcher::{load_universe, Fetcher};
use crate::scan::{scan_event_consumer, Scanner};
use crate::sector::SectorBook;
use crate::state::SeriesCache;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", cfg.db_path)).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Universe and sectors: fail fast on bad input files ---
    let universe = load_universe(&cfg)?;
    let sectors = SectorBook::load(cfg.sector_map_path.as_deref(), cfg.criteria.weights.sector.clone())?;
    info!(
        "Universe: {} tickers | sector overrides: {} tickers | mode: {}",
        universe.len(),
        sectors.len(),
        cfg.criteria.mode,
    );
    if cfg.sector_map_path.is_none() {
        info!("SECTOR_MAP_PATH not set: sectors come from provider company profiles");
    }

    if let Ok(previous) = snapshot::read(&cfg.snapshot_path) {
        info!(
            "Previous snapshot: scan {} with {} hits",
            previous.summary.scan_id,
            previous.hits.len(),
        );
    }

    // --- Shared state ---
    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let cache = SeriesCache::new();
    let fetcher = Arc::new(Fetcher::new(&cfg, cache, Arc::clone(&latency))?);
    info!("Price provider: {}", fetcher.provider().name());

    // --- Channels ---
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_CAPACITY);
    // one pending on-demand request at most
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

    // --- Spawn tasks ---

    // Scan progress logger
    tokio::spawn(async move { scan_event_consumer(event_rx).await });

    // Result writer: SQLite + JSON snapshot
    let writer = ResultWriter::new(
        pool.clone(),
        writer_rx,
        Arc::clone(&health),
        cfg.snapshot_path.clone(),
        cfg.criteria.min_display_score,
    );
    tokio::spawn(async move { writer.run().await });

    // Scanner (startup scan, then every SCAN_INTERVAL_SECS)
    let scanner = Scanner::new(
        cfg.clone(),
        Arc::clone(&fetcher),
        pool.clone(),
        sectors.clone(),
        Arc::clone(&health),
        trigger_rx,
        event_tx,
        writer_tx,
    );
    tokio::spawn(async move { scanner.run().await });

    // HTTP API server
    let api_state = ApiState {
        pool: pool.clone(),
        health,
        latency,
        fetcher,
        criteria: Arc::new(cfg.criteria.clone()),
        sectors: Arc::new(sectors),
        trigger_tx,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
