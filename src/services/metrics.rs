use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::services::ReconciliationReport;

/// Metrics collector for observability
#[derive(Debug, Default)]
pub struct Metrics {
    /// Slices accepted by the broker
    pub slices_submitted: AtomicU64,
    /// Slices recorded as dry_run
    pub slices_dry_run: AtomicU64,
    /// Slices blocked by the kill switch or circuit breaker
    pub slices_blocked: AtomicU64,
    /// Slices rejected by the broker
    pub slices_rejected: AtomicU64,
    /// Slices failed (infrastructure or retry exhaustion)
    pub slices_failed: AtomicU64,
    /// Slices that found themselves canceled at execution time
    pub slices_aborted: AtomicU64,
    /// Connection-class submission retries
    pub submit_retries: AtomicU64,
    /// Accepted slices recorded as submitted_unconfirmed
    pub ledger_write_fallbacks: AtomicU64,
    /// Fills applied to the ledger
    pub fills_processed: AtomicU64,
    /// Fill redeliveries dropped
    pub fills_duplicate: AtomicU64,
    pub reconciliation_runs: AtomicU64,
    pub reconciliation_failures: AtomicU64,
    pub reconciliation_orders_updated: AtomicU64,
    pub reconciliation_orders_skipped: AtomicU64,
    pub reconciliation_orders_failed: AtomicU64,
    pub orphans_detected: AtomicU64,
    pub positions_flattened: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_slices_submitted(&self) {
        self.slices_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_dry_run(&self) {
        self.slices_dry_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_blocked(&self) {
        self.slices_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_rejected(&self) {
        self.slices_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_failed(&self) {
        self.slices_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_slices_aborted(&self) {
        self.slices_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submit_retries(&self) {
        self.submit_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ledger_write_fallbacks(&self) {
        self.ledger_write_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fills_processed(&self) {
        self.fills_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fills_duplicate(&self) {
        self.fills_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconciliation_failures(&self) {
        self.reconciliation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one successful run into the counters
    pub fn record_reconciliation(&self, report: &ReconciliationReport) {
        self.reconciliation_runs.fetch_add(1, Ordering::Relaxed);
        self.reconciliation_orders_updated
            .fetch_add(report.orders_updated, Ordering::Relaxed);
        self.reconciliation_orders_skipped
            .fetch_add(report.orders_skipped, Ordering::Relaxed);
        self.reconciliation_orders_failed
            .fetch_add(report.orders_failed, Ordering::Relaxed);
        self.orphans_detected
            .fetch_add(report.orphans_detected, Ordering::Relaxed);
        self.positions_flattened
            .fetch_add(report.positions_flattened, Ordering::Relaxed);
    }

    fn counters(&self) -> [(&'static str, &'static str, u64); 17] {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        [
            ("tally_slices_submitted_total", "Slices accepted by the broker", load(&self.slices_submitted)),
            ("tally_slices_dry_run_total", "Slices recorded without a broker", load(&self.slices_dry_run)),
            ("tally_slices_blocked_total", "Slices blocked by a safety gate", load(&self.slices_blocked)),
            ("tally_slices_rejected_total", "Slices rejected by the broker", load(&self.slices_rejected)),
            ("tally_slices_failed_total", "Slices failed", load(&self.slices_failed)),
            ("tally_slices_aborted_total", "Slices canceled before execution", load(&self.slices_aborted)),
            ("tally_submit_retries_total", "Submission retries after connection errors", load(&self.submit_retries)),
            ("tally_ledger_write_fallbacks_total", "Accepted slices recorded as submitted_unconfirmed", load(&self.ledger_write_fallbacks)),
            ("tally_fills_processed_total", "Fills applied", load(&self.fills_processed)),
            ("tally_fills_duplicate_total", "Fill redeliveries dropped", load(&self.fills_duplicate)),
            ("tally_reconciliation_runs_total", "Successful reconciliation runs", load(&self.reconciliation_runs)),
            ("tally_reconciliation_failures_total", "Failed reconciliation runs", load(&self.reconciliation_failures)),
            ("tally_reconciliation_orders_updated_total", "Orders healed by reconciliation", load(&self.reconciliation_orders_updated)),
            ("tally_reconciliation_orders_skipped_total", "Reconciliation writes rejected by CAS", load(&self.reconciliation_orders_skipped)),
            ("tally_reconciliation_orders_failed_total", "Orders failed as missing at the broker", load(&self.reconciliation_orders_failed)),
            ("tally_orphans_detected_total", "Broker orders with no ledger row", load(&self.orphans_detected)),
            ("tally_positions_flattened_total", "Local positions forced flat", load(&self.positions_flattened)),
        ]
    }

    /// Export metrics in Prometheus text format
    pub fn prometheus(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in self.counters() {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_lists_every_counter() {
        let metrics = Metrics::new();
        metrics.inc_slices_submitted();
        metrics.inc_slices_submitted();
        let text = metrics.prometheus();
        assert!(text.contains("tally_slices_submitted_total 2"));
        assert!(text.contains("# TYPE tally_orphans_detected_total counter"));
        assert_eq!(text.lines().filter(|l| l.starts_with("# HELP")).count(), 17);
    }
}
