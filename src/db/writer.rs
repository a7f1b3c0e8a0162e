use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::api::health::HealthState;
use crate::db::queries::complete_scan;
use crate::error::Result;
use crate::snapshot::{self, Snapshot};
use crate::types::CompletedScan;

/// Receives completed scans from the scanner and persists them to SQLite,
/// then refreshes the JSON snapshot. Runs as a dedicated background task.
pub struct ResultWriter {
    pool: sqlx::SqlitePool,
    scan_rx: mpsc::Receiver<CompletedScan>,
    health: Arc<HealthState>,
    snapshot_path: String,
    min_display_score: f64,
}

impl ResultWriter {
    pub fn new(
        pool: sqlx::SqlitePool,
        scan_rx: mpsc::Receiver<CompletedScan>,
        health: Arc<HealthState>,
        snapshot_path: String,
        min_display_score: f64,
    ) -> Self {
        Self { pool, scan_rx, health, snapshot_path, min_display_score }
    }

    pub async fn run(mut self) {
        while let Some(scan) = self.scan_rx.recv().await {
            self.health.dec_write_queue_pending();
            if let Err(e) = self.write_scan(&scan).await {
                error!(scan_id = scan.summary.scan_id, "DB write error: {e}");
            }
        }
    }

    async fn write_scan(&self, scan: &CompletedScan) -> Result<()> {
        complete_scan(&self.pool, scan).await?;
        self.health.set_last_scan_id(scan.summary.scan_id);

        let snap = Snapshot::from_scan(scan, self.min_display_score);
        if let Err(e) = snapshot::write(&self.snapshot_path, &snap) {
            error!(path = %self.snapshot_path, "Snapshot write failed: {e}");
        }

        info!(
            event = "SCAN_PERSISTED",
            scan_id = scan.summary.scan_id,
            results = scan.results.len(),
            hits = snap.hits.len(),
            "Scan {} persisted: {} results, {} hits",
            scan.summary.scan_id,
            scan.results.len(),
            snap.hits.len(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::test_support::{memory_pool, result};
    use crate::db::queries::{insert_scan, latest_results, latest_summary};
    use crate::types::{ScanMode, ScanSummary};

    #[tokio::test]
    async fn writer_persists_scan_and_snapshot() {
        let pool = memory_pool().await;
        let health = Arc::new(HealthState::new());
        let path = std::env::temp_dir().join(format!("writer_snapshot_{}.json", std::process::id()));
        let (tx, rx) = mpsc::channel(4);
        let writer = ResultWriter::new(
            pool.clone(),
            rx,
            Arc::clone(&health),
            path.to_string_lossy().into_owned(),
            60.0,
        );

        let scan_id = insert_scan(&pool, ScanMode::Retest, 1_000, 2).await.unwrap();
        let summary = ScanSummary {
            scan_id,
            mode: Some(ScanMode::Retest),
            started_at: 1_000,
            finished_at: Some(1_090),
            universe: 2,
            evaluated: 2,
            hits: 1,
            ..ScanSummary::default()
        };
        health.inc_write_queue_pending();
        tx.send(CompletedScan { summary, results: vec![result("AAA", 75.0), result("BBB", 20.0)] })
            .await
            .unwrap();
        drop(tx);
        writer.run().await;

        assert_eq!(health.last_scan_id(), scan_id);
        assert_eq!(health.write_queue_pending(), 0);
        assert_eq!(latest_summary(&pool).await.unwrap().unwrap().hits, 1);
        assert_eq!(latest_results(&pool, 0.0, None, 10).await.unwrap().len(), 2);

        let snap = snapshot::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(snap.hits.len(), 1);
        assert_eq!(snap.hits[0].ticker, "AAA");
    }
}
