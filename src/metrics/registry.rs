//! Counters for sequence allocation and migration runs.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::Histogram;
use crate::contracts::{MigrationReport, Operation, RunOutcome};

/// Central registry for seqkeep metrics.
#[derive(Default)]
pub struct MetricsRegistry {
    pub sequence: Arc<SequenceMetrics>,
    pub reconcile: Arc<ReconcileMetrics>,
    pub rekey: Arc<RekeyMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a finished (or aborted) report into the run counters.
    pub fn record_report(&self, report: &MigrationReport) {
        match report.operation {
            Operation::TypeReconciliation => self.reconcile.record(report),
            Operation::TenantRekey => self.rekey.record(report),
        }
    }

    /// Formats all metrics in Prometheus exposition format.
    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);
        output.push_str(&self.sequence.format_prometheus());
        output.push_str(&self.reconcile.format_prometheus());
        output.push_str(&self.rekey.format_prometheus());
        output
    }
}

fn write_counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    let _ = writeln!(output, "{} {}", name, value);
    output.push('\n');
}

/// Sequence store metrics.
#[derive(Default)]
pub struct SequenceMetrics {
    pub allocations_total: AtomicU64,
    pub allocation_errors_total: AtomicU64,
    /// Watermark repairs that actually moved a counter forward
    pub watermark_repairs_total: AtomicU64,
}

impl SequenceMetrics {
    #[inline]
    pub fn record_allocation(&self, ok: bool) {
        if ok {
            self.allocations_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allocation_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_repair(&self) {
        self.watermark_repairs_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(512);
        write_counter(
            &mut output,
            "seqkeep_allocations_total",
            "Sequence values handed out",
            self.allocations_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_allocation_errors_total",
            "Failed sequence allocations",
            self.allocation_errors_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_watermark_repairs_total",
            "Counters advanced to cover existing data",
            self.watermark_repairs_total.load(Ordering::Relaxed),
        );
        output
    }
}

/// Type reconciliation metrics.
#[derive(Default)]
pub struct ReconcileMetrics {
    pub runs_total: AtomicU64,
    pub incomplete_runs_total: AtomicU64,
    pub records_scanned_total: AtomicU64,
    pub records_converted_total: AtomicU64,
    pub records_skipped_total: AtomicU64,
    pub records_stale_total: AtomicU64,
    /// Time spent per page of non-conforming records
    pub page_duration_ms: Histogram,
}

impl ReconcileMetrics {
    fn record(&self, report: &MigrationReport) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        if report.outcome == RunOutcome::Incomplete {
            self.incomplete_runs_total.fetch_add(1, Ordering::Relaxed);
        }
        self.records_scanned_total
            .fetch_add(report.scanned, Ordering::Relaxed);
        self.records_converted_total
            .fetch_add(report.converted, Ordering::Relaxed);
        self.records_skipped_total
            .fetch_add(report.skipped, Ordering::Relaxed);
        self.records_stale_total
            .fetch_add(report.stale, Ordering::Relaxed);
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);
        write_counter(
            &mut output,
            "seqkeep_reconcile_runs_total",
            "Type reconciliation runs",
            self.runs_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_reconcile_incomplete_runs_total",
            "Type reconciliation runs that stopped early",
            self.incomplete_runs_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_reconcile_records_scanned_total",
            "Non-conforming records examined",
            self.records_scanned_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_reconcile_records_converted_total",
            "Records rewritten to a numeric sequence value",
            self.records_converted_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_reconcile_records_skipped_total",
            "Records left untouched because their value did not parse",
            self.records_skipped_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_reconcile_records_stale_total",
            "Conditional writes lost to concurrent writers",
            self.records_stale_total.load(Ordering::Relaxed),
        );
        output.push_str(&self.page_duration_ms.format_prometheus(
            "seqkeep_reconcile_page_duration_ms",
            "Time to convert one page of records in milliseconds",
        ));
        output.push('\n');
        output
    }
}

/// Tenant rekey metrics.
#[derive(Default)]
pub struct RekeyMetrics {
    pub runs_total: AtomicU64,
    pub dry_runs_total: AtomicU64,
    pub collection_failures_total: AtomicU64,
    /// Documents modified per collection across all runs
    pub modified_by_collection: DashMap<String, u64>,
}

impl RekeyMetrics {
    fn record(&self, report: &MigrationReport) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        if report.outcome == RunOutcome::DryRun {
            self.dry_runs_total.fetch_add(1, Ordering::Relaxed);
        }
        for outcome in &report.collections {
            if outcome.error.is_some() {
                self.collection_failures_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            if outcome.modified > 0 {
                self.modified_by_collection
                    .entry(outcome.collection.clone())
                    .and_modify(|v| *v += outcome.modified)
                    .or_insert(outcome.modified);
            }
        }
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);
        write_counter(
            &mut output,
            "seqkeep_rekey_runs_total",
            "Tenant rekey runs including dry runs",
            self.runs_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_rekey_dry_runs_total",
            "Tenant rekey dry runs",
            self.dry_runs_total.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            "seqkeep_rekey_collection_failures_total",
            "Collections whose bulk update failed",
            self.collection_failures_total.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            output,
            "# HELP seqkeep_rekey_modified_total Documents rewritten by rekey per collection"
        );
        let _ = writeln!(output, "# TYPE seqkeep_rekey_modified_total counter");
        let mut rows: Vec<(String, u64)> = self
            .modified_by_collection
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        rows.sort();
        for (collection, value) in rows {
            let _ = writeln!(
                output,
                "seqkeep_rekey_modified_total{{collection=\"{}\"}} {}",
                collection, value
            );
        }
        output.push('\n');
        output
    }
}
