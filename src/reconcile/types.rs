//! Type reconciliation: rewrites string-typed sequence values as numbers and
//! repairs the governing counter so it covers the corrected data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::contracts::{
    parse_sequence_value, AnomalyKind, Document, Filter, MigrationError, MigrationReport,
    Operation, RecordRepository, ReconciliationStatus, Representation, RunOutcome, SampleRecord,
    SequenceStore, StorageError, WriteOutcome,
};
use crate::metrics::MetricsRegistry;

use super::escalate;

/// Default number of non-conforming records fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default number of records in the verification sample.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Default number of distinct values tracked by the duplicate check.
pub const DEFAULT_DUPLICATE_CHECK_LIMIT: usize = 1_000_000;

/// A collection whose field is governed by a sequence counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedCollection {
    pub collection: String,
    /// Dotted path of the sequence field.
    pub field: String,
    /// Counter key in the sequence store.
    pub counter: String,
}

impl SequencedCollection {
    pub fn new(
        collection: impl Into<String>,
        field: impl Into<String>,
        counter: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
            counter: counter.into(),
        }
    }
}

/// Configuration for type reconciliation runs.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Non-conforming records fetched per page (bounded memory).
    pub page_size: usize,
    /// Top-N records returned in the verification sample.
    pub sample_size: usize,
    /// Distinct values remembered by the duplicate check. Once reached, later
    /// records are still checked against the remembered values but are not
    /// added themselves.
    pub duplicate_check_limit: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            sample_size: DEFAULT_SAMPLE_SIZE,
            duplicate_check_limit: DEFAULT_DUPLICATE_CHECK_LIMIT,
        }
    }
}

impl ReconcileConfig {
    /// Reads `SEQKEEP_PAGE_SIZE`, `SEQKEEP_SAMPLE_SIZE` and
    /// `SEQKEEP_DUPLICATE_CHECK_LIMIT`, falling back to defaults on missing or
    /// invalid values.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            page_size: std::env::var("SEQKEEP_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default.page_size),
            sample_size: std::env::var("SEQKEEP_SAMPLE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.sample_size),
            duplicate_check_limit: std::env::var("SEQKEEP_DUPLICATE_CHECK_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.duplicate_check_limit),
        }
    }
}

/// Converts non-numeric sequence values in one collection and reconciles the
/// counter watermark with the result.
///
/// Every write is a per-document conditional replace, so concurrent writers
/// touching other fields (or allocating new sequence values) are never
/// clobbered. A second run after a successful one finds nothing to convert.
pub struct TypeReconciler<S> {
    store: Arc<S>,
    config: ReconcileConfig,
    cancel: Arc<AtomicBool>,
    metrics: Arc<MetricsRegistry>,
}

impl<S> TypeReconciler<S>
where
    S: SequenceStore + RecordRepository,
{
    pub fn new(store: Arc<S>, config: ReconcileConfig) -> Self {
        Self {
            store,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Shares a cancellation flag; the run stops at the next page boundary
    /// once it is set.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Runs a full reconciliation of `target`.
    ///
    /// Returns `MigrationError::Connection` carrying the partial report when
    /// storage goes away mid-run.
    pub fn run(&self, target: &SequencedCollection) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::new(Operation::TypeReconciliation, &target.collection);
        tracing::info!(
            run_id = %report.run_id,
            collection = %target.collection,
            field = %target.field,
            counter = %target.counter,
            "Starting type reconciliation"
        );

        let result = self.execute(&mut report, target);
        self.metrics.record_report(&report);

        match result {
            Ok(()) => {
                tracing::info!(
                    run_id = %report.run_id,
                    outcome = ?report.outcome,
                    scanned = report.scanned,
                    converted = report.converted,
                    skipped = report.skipped,
                    stale = report.stale,
                    watermark_before = ?report.watermark_before,
                    watermark_after = ?report.watermark_after,
                    "Type reconciliation finished"
                );
                Ok(report)
            }
            Err(e) => Err(escalate(report, e)),
        }
    }

    fn execute(
        &self,
        report: &mut MigrationReport,
        target: &SequencedCollection,
    ) -> Result<(), MigrationError> {
        let defect = Filter::non_numeric(&target.field);

        let pending = match self.store.count(&target.collection, &defect) {
            Ok(n) => n,
            Err(StorageError::CollectionNotFound(_)) => {
                report.note("collection does not exist; nothing to reconcile");
                report.finish(RunOutcome::Completed);
                return Ok(());
            }
            Err(e) => {
                self.contain(report, target, "counting non-numeric values", e.into())?;
                report.finish(RunOutcome::Incomplete);
                return Ok(());
            }
        };

        if pending == 0 {
            report.note("no non-numeric values found; maximum scan skipped");
            report.finish(RunOutcome::Completed);
            return Ok(());
        }

        tracing::info!(
            collection = %target.collection,
            pending = pending,
            page_size = self.config.page_size,
            "Converting non-numeric sequence values"
        );

        let page_size = self.config.page_size.max(1);
        let mut complete = true;
        let mut after: Option<String> = None;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!(
                    collection = %target.collection,
                    scanned = report.scanned,
                    "Reconciliation cancelled"
                );
                report.note("cancelled before completion; re-run to finish");
                report.finish(RunOutcome::Incomplete);
                return Ok(());
            }

            let started = Instant::now();
            let page = match self.store.find_page(
                &target.collection,
                &defect,
                after.as_deref(),
                page_size,
            ) {
                Ok(page) => page,
                Err(e) => {
                    self.contain(report, target, "reading the next page", e.into())?;
                    complete = false;
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let full = page.len() == page_size;

            for doc in page {
                self.convert(report, target, doc)?;
            }
            self.metrics
                .reconcile
                .page_duration_ms
                .observe(started.elapsed());

            if !full {
                break;
            }
        }

        // Converted values must be covered by the counter even when paging
        // stopped early.
        if let Err(e) = self.repair_watermark(report, target) {
            self.contain(report, target, "repairing the watermark", e)?;
            complete = false;
        }
        if let Err(e) = self.verify(report, target) {
            self.contain(report, target, "verifying the result", e)?;
        }

        if complete {
            report.finish(RunOutcome::Completed);
        } else {
            report.note("some steps failed; see anomalies and re-run once resolved");
            report.finish(RunOutcome::Incomplete);
        }
        Ok(())
    }

    /// Records a collection-wide failure as a `Read` anomaly. Connection loss
    /// is handed back to the caller instead.
    fn contain(
        &self,
        report: &mut MigrationReport,
        target: &SequencedCollection,
        step: &str,
        err: MigrationError,
    ) -> Result<(), MigrationError> {
        if err.is_connection_loss() {
            return Err(err);
        }
        tracing::warn!(
            collection = %target.collection,
            step = step,
            error = %err,
            "Reconciliation step failed"
        );
        report.anomaly(
            AnomalyKind::Read,
            &target.collection,
            None,
            format!("{} failed: {}", step, err),
        );
        Ok(())
    }

    /// Converts one record. Only connection loss is propagated.
    fn convert(
        &self,
        report: &mut MigrationReport,
        target: &SequencedCollection,
        doc: Document,
    ) -> Result<(), MigrationError> {
        report.scanned += 1;
        let Some(raw) = doc.get_path(&target.field) else {
            return Ok(());
        };

        let Some(value) = parse_sequence_value(raw) else {
            tracing::warn!(
                collection = %target.collection,
                id = %doc.id,
                value = %raw,
                "Unparseable sequence value, skipping"
            );
            report.skipped += 1;
            report.anomaly(
                AnomalyKind::Parse,
                &target.collection,
                Some(doc.id.as_str()),
                format!("{} is not a non-negative integer: {}", target.field, raw),
            );
            return Ok(());
        };

        match self.store.replace_field_if(
            &target.collection,
            &doc.id,
            &target.field,
            raw,
            Value::from(value),
        ) {
            Ok(WriteOutcome::Applied) => report.converted += 1,
            Ok(WriteOutcome::Stale) => {
                report.stale += 1;
                report.anomaly(
                    AnomalyKind::Stale,
                    &target.collection,
                    Some(doc.id.as_str()),
                    "value changed during conversion; left for the next run",
                );
            }
            Ok(WriteOutcome::Missing) => {
                tracing::debug!(id = %doc.id, "Record deleted during conversion");
            }
            Err(e) if e.is_connection_loss() => return Err(e.into()),
            Err(e) => {
                report.skipped += 1;
                report.anomaly(
                    AnomalyKind::Write,
                    &target.collection,
                    Some(doc.id.as_str()),
                    e.to_string(),
                );
            }
        }
        Ok(())
    }

    /// Advances the counter when the data has outrun it.
    fn repair_watermark(
        &self,
        report: &mut MigrationReport,
        target: &SequencedCollection,
    ) -> Result<(), MigrationError> {
        let data_max = self
            .store
            .max_sequence(&target.collection, &target.field)?;
        let before = self.store.peek(&target.counter)?;
        report.data_max = data_max;
        report.watermark_before = before;

        let after = match data_max {
            Some(max) if before.map_or(true, |w| w < max) => {
                let watermark = self.store.advance_to(&target.counter, max)?;
                self.metrics.sequence.record_repair();
                tracing::info!(
                    counter = %target.counter,
                    before = ?before,
                    after = watermark,
                    "Advanced watermark to cover existing data"
                );
                Some(watermark)
            }
            _ => before,
        };
        report.watermark_after = after;
        Ok(())
    }

    /// Samples the top of the collection and looks for duplicate values.
    fn verify(
        &self,
        report: &mut MigrationReport,
        target: &SequencedCollection,
    ) -> Result<(), MigrationError> {
        let top = self.store.top_by_sequence(
            &target.collection,
            &target.field,
            self.config.sample_size,
        )?;
        report.sample = top
            .into_iter()
            .map(|doc| {
                let value = doc.get_path(&target.field).cloned().unwrap_or(Value::Null);
                SampleRecord {
                    representation: Representation::of(&value),
                    id: doc.id,
                    value,
                }
            })
            .collect();

        for record in &report.sample {
            if record.representation != Representation::Number {
                tracing::warn!(id = %record.id, "Non-numeric value among sampled records");
            }
        }

        let limit = self.config.duplicate_check_limit;
        let mut seen: HashMap<u64, String> = HashMap::new();
        let mut untracked = 0u64;
        let mut duplicates: Vec<(String, String, u64)> = Vec::new();
        self.store
            .scan(&target.collection, &Filter::All, |doc| {
                let Some(v) = doc.get_path(&target.field).and_then(parse_sequence_value) else {
                    return;
                };
                if let Some(first) = seen.get(&v) {
                    duplicates.push((doc.id, first.clone(), v));
                } else if seen.len() < limit {
                    seen.insert(v, doc.id);
                } else {
                    untracked += 1;
                }
            })?;

        if untracked > 0 {
            tracing::warn!(
                collection = %target.collection,
                limit = limit,
                untracked = untracked,
                "Duplicate check limit reached"
            );
            report.note(format!(
                "duplicate check tracked the first {} distinct values; {} later values were only compared against those",
                limit, untracked
            ));
        }

        for (id, first, value) in duplicates {
            report.anomaly(
                AnomalyKind::Duplicate,
                &target.collection,
                Some(id.as_str()),
                format!("sequence value {} already used by {}", value, first),
            );
        }
        Ok(())
    }

    /// Read-only pre-flight view of `target`.
    pub fn status(
        &self,
        target: &SequencedCollection,
    ) -> Result<ReconciliationStatus, MigrationError> {
        let mut status = ReconciliationStatus {
            collection: target.collection.clone(),
            field: target.field.clone(),
            counter: target.counter.clone(),
            total_records: 0,
            non_conforming_count: 0,
            max_value: None,
            max_value_type: None,
            watermark: self.store.peek(&target.counter)?,
        };

        let mut max: Option<(u64, Representation)> = None;
        let scanned = self.store.scan(&target.collection, &Filter::All, |doc| {
            status.total_records += 1;
            let Some(raw) = doc.get_path(&target.field) else {
                return;
            };
            if !raw.is_number() {
                status.non_conforming_count += 1;
            }
            if let Some(v) = parse_sequence_value(raw) {
                if max.map_or(true, |(m, _)| v > m) {
                    max = Some((v, Representation::of(raw)));
                }
            }
        });

        match scanned {
            Ok(()) | Err(StorageError::CollectionNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        status.max_value = max.map(|(v, _)| v);
        status.max_value_type = max.map(|(_, r)| r);
        Ok(status)
    }
}
