//! JSON snapshot of the latest scan: the summary plus every hit, ranked.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{CompletedScan, ScanSummary, ScoredResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub summary: ScanSummary,
    pub hits: Vec<ScoredResult>,
}

impl Snapshot {
    /// Keep results at or above `min_score`, highest first.
    pub fn from_scan(scan: &CompletedScan, min_score: f64) -> Self {
        let mut hits: Vec<ScoredResult> = scan
            .results
            .iter()
            .filter(|r| r.normalized_score >= min_score)
            .cloned()
            .collect();
        hits.sort_by(|a, b| {
            b.normalized_score
                .total_cmp(&a.normalized_score)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });
        Self {
            summary: scan.summary.clone(),
            hits,
        }
    }
}

/// Write through a temp file and rename, so readers never see a partial file.
pub fn write(path: impl AsRef<Path>, snapshot: &Snapshot) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read(path: impl AsRef<Path>) -> Result<Snapshot> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::test_support::result;

    #[test]
    fn snapshot_keeps_ranked_hits_and_survives_disk() {
        let scan = CompletedScan {
            summary: ScanSummary { scan_id: 7, hits: 2, ..ScanSummary::default() },
            results: vec![result("LOW", 30.0), result("B", 70.0), result("A", 70.0), result("TOP", 90.0)],
        };
        let snap = Snapshot::from_scan(&scan, 60.0);
        let tickers: Vec<&str> = snap.hits.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["TOP", "A", "B"]);

        let path = std::env::temp_dir().join(format!("snapshot_{}.json", std::process::id()));
        write(&path, &snap).unwrap();
        let back = read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back.summary.scan_id, 7);
        assert_eq!(back.hits.len(), 3);
    }
}
