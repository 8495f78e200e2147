//! Tenant rekey: rewrites a scope identifier across every collection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::Value;

use crate::contracts::{
    AnomalyKind, CollectionOutcome, Filter, MigrationError, MigrationReport, Operation,
    RecordRepository, RunOutcome, StorageError, UpdateCounts, VerificationCounts,
};
use crate::metrics::MetricsRegistry;

use super::escalate;

/// Default name of the tenant scoping field.
pub const DEFAULT_SCOPE_FIELD: &str = "tenant_id";

/// Collections re-counted after every confirmed rekey unless overridden.
pub const DEFAULT_VERIFY_COLLECTIONS: [&str; 5] =
    ["orders", "customers", "carriers", "drivers", "loads"];

/// Configuration for tenant rekey runs.
#[derive(Debug, Clone)]
pub struct RekeyConfig {
    /// Dotted path of the scope field.
    pub scope_field: String,
    /// Collections independently re-counted after the update. Missing ones
    /// are skipped.
    pub verify_collections: Vec<String>,
}

impl Default for RekeyConfig {
    fn default() -> Self {
        Self {
            scope_field: DEFAULT_SCOPE_FIELD.to_string(),
            verify_collections: DEFAULT_VERIFY_COLLECTIONS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl RekeyConfig {
    /// Reads `SEQKEEP_SCOPE_FIELD` and `SEQKEEP_VERIFY_COLLECTIONS`
    /// (comma-separated).
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            scope_field: std::env::var("SEQKEEP_SCOPE_FIELD")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default.scope_field),
            verify_collections: std::env::var("SEQKEEP_VERIFY_COLLECTIONS")
                .ok()
                .map(|v| split_list(&v))
                .filter(|list| !list.is_empty())
                .unwrap_or(default.verify_collections),
        }
    }
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One rekey invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RekeyRequest {
    pub old_scope: String,
    pub new_scope: String,
    /// Without confirmation the run only counts matches.
    pub confirm: bool,
    /// Explicit collection list. `None` enumerates the backend.
    pub collections: Option<Vec<String>>,
}

impl RekeyRequest {
    pub fn new(old_scope: impl Into<String>, new_scope: impl Into<String>, confirm: bool) -> Self {
        Self {
            old_scope: old_scope.into(),
            new_scope: new_scope.into(),
            confirm,
            collections: None,
        }
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = Some(collections);
        self
    }

    fn validate(&self, scope_field: &str) -> Result<(), MigrationError> {
        if scope_field.trim().is_empty() {
            return Err(MigrationError::InvalidRequest(
                "scope field must not be empty".into(),
            ));
        }
        if self.old_scope.trim().is_empty() || self.new_scope.trim().is_empty() {
            return Err(MigrationError::InvalidRequest(
                "scope values must not be empty".into(),
            ));
        }
        if self.old_scope == self.new_scope {
            return Err(MigrationError::InvalidRequest(format!(
                "old and new scope are both '{}'",
                self.old_scope
            )));
        }
        Ok(())
    }
}

/// Replaces one scope value with another across collections, tolerating
/// per-collection failures.
pub struct TenantRekeyer<S> {
    store: Arc<S>,
    config: RekeyConfig,
    cancel: Arc<AtomicBool>,
    metrics: Arc<MetricsRegistry>,
}

impl<S> TenantRekeyer<S>
where
    S: RecordRepository,
{
    pub fn new(store: Arc<S>, config: RekeyConfig) -> Self {
        Self {
            store,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Shares a cancellation flag, checked between collections.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &RekeyConfig {
        &self.config
    }

    pub fn run(&self, request: &RekeyRequest) -> Result<MigrationReport, MigrationError> {
        request.validate(&self.config.scope_field)?;

        let mut report = MigrationReport::new(
            Operation::TenantRekey,
            format!("{} -> {}", request.old_scope, request.new_scope),
        );
        tracing::info!(
            run_id = %report.run_id,
            scope_field = %self.config.scope_field,
            old = %request.old_scope,
            new = %request.new_scope,
            confirm = request.confirm,
            "Starting tenant rekey"
        );

        let result = self.execute(&mut report, request);
        self.metrics.record_report(&report);

        match result {
            Ok(()) => {
                tracing::info!(
                    run_id = %report.run_id,
                    outcome = ?report.outcome,
                    collections = report.collections.len(),
                    matched = report.total_matched,
                    modified = report.total_modified,
                    anomalies = report.anomalies.len(),
                    "Tenant rekey finished"
                );
                Ok(report)
            }
            Err(e) => Err(escalate(report, e)),
        }
    }

    fn execute(
        &self,
        report: &mut MigrationReport,
        request: &RekeyRequest,
    ) -> Result<(), MigrationError> {
        let targets = match self.resolve_collections(report, request) {
            Ok(targets) => targets,
            Err(e) if e.is_connection_loss() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot enumerate collections");
                report.note(format!("cannot enumerate collections: {}", e));
                report.finish(RunOutcome::Incomplete);
                return Ok(());
            }
        };
        let field = self.config.scope_field.as_str();
        let old = Value::String(request.old_scope.clone());
        let new = Value::String(request.new_scope.clone());

        for collection in &targets {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!(collection = %collection, "Rekey cancelled");
                report.note("cancelled before completion; re-run to finish");
                report.finish(RunOutcome::Incomplete);
                return Ok(());
            }

            let attempt = if request.confirm {
                self.store.update_many(collection, field, &old, &new)
            } else {
                self.store
                    .count(collection, &Filter::eq(field, old.clone()))
                    .map(|matched| UpdateCounts {
                        matched,
                        ..UpdateCounts::default()
                    })
            };

            match attempt {
                Ok(counts) => {
                    tracing::debug!(
                        collection = %collection,
                        matched = counts.matched,
                        modified = counts.modified,
                        failed = counts.failed,
                        "Collection processed"
                    );
                    let outcome = CollectionOutcome::succeeded(collection, counts);
                    if let Some(error) = &outcome.error {
                        report.anomaly(AnomalyKind::CollectionUpdate, collection, None, error.clone());
                    }
                    report.push_collection(outcome);
                }
                Err(e) if e.is_connection_loss() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Collection update failed");
                    report.anomaly(AnomalyKind::CollectionUpdate, collection, None, e.to_string());
                    report.push_collection(CollectionOutcome::failed(collection, e.to_string()));
                }
            }
        }

        if !request.confirm {
            report.note("confirmation required: dry run, no documents were modified");
            report.finish(RunOutcome::DryRun);
            return Ok(());
        }

        self.verify(report, &old, &new)?;
        report.finish(RunOutcome::Completed);
        Ok(())
    }

    /// Enumerates the backend, or checks an explicit list against it.
    fn resolve_collections(
        &self,
        report: &mut MigrationReport,
        request: &RekeyRequest,
    ) -> Result<Vec<String>, MigrationError> {
        let existing = self.store.list_collections()?;
        let Some(requested) = &request.collections else {
            return Ok(existing);
        };

        let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
        let mut targets = Vec::with_capacity(requested.len());
        for name in requested {
            if known.contains(name.as_str()) {
                targets.push(name.clone());
            } else {
                report.anomaly(
                    AnomalyKind::CollectionUpdate,
                    name,
                    None,
                    "collection does not exist",
                );
            }
        }
        Ok(targets)
    }

    /// Recounts old, new and total records in the verification collections.
    /// A collection that cannot be recounted becomes a `Verification`
    /// anomaly; only connection loss is returned.
    fn verify(
        &self,
        report: &mut MigrationReport,
        old: &Value,
        new: &Value,
    ) -> Result<(), MigrationError> {
        let existing: HashSet<String> = match self.store.list_collections() {
            Ok(list) => list.into_iter().collect(),
            Err(e) if e.is_connection_loss() => return Err(e.into()),
            Err(e) => {
                report.anomaly(
                    AnomalyKind::Verification,
                    "*",
                    None,
                    format!("cannot enumerate collections for verification: {}", e),
                );
                return Ok(());
            }
        };
        let targets: Vec<&String> = self
            .config
            .verify_collections
            .iter()
            .filter(|c| existing.contains(c.as_str()))
            .collect();

        let field = self.config.scope_field.as_str();
        let store = self.store.as_ref();
        let results: Vec<(&String, Result<VerificationCounts, StorageError>)> = targets
            .par_iter()
            .map(|&collection| (collection, recount(store, collection, field, old, new)))
            .collect();

        for (collection, result) in results {
            match result {
                Ok(v) => {
                    if v.old_scope > 0 {
                        tracing::warn!(
                            collection = %v.collection,
                            remaining = v.old_scope,
                            "Old scope value still present after rekey"
                        );
                        report.anomaly(
                            AnomalyKind::Verification,
                            &v.collection,
                            None,
                            format!("{} records still carry the old scope", v.old_scope),
                        );
                    }
                    report.verification.push(v);
                }
                Err(e) if e.is_connection_loss() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(collection = %collection, error = %e, "Recount failed");
                    report.anomaly(
                        AnomalyKind::Verification,
                        collection,
                        None,
                        format!("cannot recount: {}", e),
                    );
                }
            }
        }
        Ok(())
    }
}

fn recount<S: RecordRepository>(
    store: &S,
    collection: &str,
    field: &str,
    old: &Value,
    new: &Value,
) -> Result<VerificationCounts, StorageError> {
    Ok(VerificationCounts {
        collection: collection.to_string(),
        old_scope: store.count(collection, &Filter::eq(field, old.clone()))?,
        new_scope: store.count(collection, &Filter::eq(field, new.clone()))?,
        total: store.count(collection, &Filter::All)?,
    })
}
