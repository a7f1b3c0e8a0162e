//! Shared health state for the /health endpoint.
//! Updated by the scanner and the result writer.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Shared health metrics. Updated by scanner components, read by API.
#[derive(Default)]
pub struct HealthState {
    /// True while a scan is in progress. At most one scan runs at a time.
    pub scan_running: AtomicBool,
    /// Unix seconds when the last scan finished (0 = none yet).
    pub last_scan_at: AtomicI64,
    /// Id of the last persisted scan (0 = none yet).
    pub last_scan_id: AtomicI64,
    /// Tickers processed so far in the running scan.
    pub scan_progress: AtomicU64,
    pub scan_total: AtomicU64,
    /// Completed scans waiting on the result writer.
    pub write_queue_pending: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the scan slot. False when a scan is already running.
    pub fn try_start_scan(&self, total: u64) -> bool {
        let claimed = self
            .scan_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.scan_progress.store(0, Ordering::Relaxed);
            self.scan_total.store(total, Ordering::Relaxed);
        }
        claimed
    }

    pub fn finish_scan(&self, finished_at: i64) {
        self.last_scan_at.store(finished_at, Ordering::Relaxed);
        self.scan_running.store(false, Ordering::Release);
    }

    /// Release the slot without recording a finish time.
    pub fn abort_scan(&self) {
        self.scan_running.store(false, Ordering::Release);
    }

    pub fn inc_scan_progress(&self) {
        self.scan_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_scan_id(&self, id: i64) {
        self.last_scan_id.store(id, Ordering::Relaxed);
    }

    pub fn inc_write_queue_pending(&self) {
        self.write_queue_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_write_queue_pending(&self) {
        self.write_queue_pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn scan_running(&self) -> bool {
        self.scan_running.load(Ordering::Acquire)
    }

    pub fn last_scan_at(&self) -> i64 {
        self.last_scan_at.load(Ordering::Relaxed)
    }

    pub fn last_scan_id(&self) -> i64 {
        self.last_scan_id.load(Ordering::Relaxed)
    }

    pub fn scan_progress(&self) -> (u64, u64) {
        (
            self.scan_progress.load(Ordering::Relaxed),
            self.scan_total.load(Ordering::Relaxed),
        )
    }

    pub fn write_queue_pending(&self) -> u64 {
        self.write_queue_pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_scan_claims_the_slot() {
        let h = HealthState::new();
        assert!(h.try_start_scan(10));
        assert!(!h.try_start_scan(10));
        h.inc_scan_progress();
        assert_eq!(h.scan_progress(), (1, 10));
        h.finish_scan(1_700_000_000);
        assert!(!h.scan_running());
        assert_eq!(h.last_scan_at(), 1_700_000_000);
        assert!(h.try_start_scan(5));
        assert_eq!(h.scan_progress(), (0, 5));
        h.abort_scan();
        assert_eq!(h.last_scan_at(), 1_700_000_000);
    }
}
