//! Batch migration operations and the operator-facing service.
//!
//! `MigrationService` is the entry point used by the CLI: it owns the store
//! handle, the registry of sequenced collections and a cancellation flag
//! shared with every run.

pub mod rekey;
pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::contracts::{
    MigrationError, MigrationReport, RecordRepository, ReconciliationStatus, RunOutcome,
    SequenceError, SequenceStore,
};
use crate::metrics::MetricsRegistry;

pub use rekey::{RekeyConfig, RekeyRequest, TenantRekeyer};
pub use types::{ReconcileConfig, SequencedCollection, TypeReconciler};

/// Turns a store-wide failure into `MigrationError::Connection` carrying the
/// partial report. Other errors pass through unchanged.
pub(crate) fn escalate(mut report: MigrationReport, err: MigrationError) -> MigrationError {
    if !err.is_connection_loss() || matches!(err, MigrationError::Connection { .. }) {
        return err;
    }

    tracing::error!(
        run_id = %report.run_id,
        error = %err,
        "Storage lost mid-run; report is incomplete"
    );
    report.note("storage connection lost; counts are partial, re-run to finish");
    report.finish(RunOutcome::Incomplete);
    MigrationError::Connection {
        reason: err.to_string(),
        partial: Box::new(report),
    }
}

/// Operator contract over a store implementing both storage traits.
pub struct MigrationService<S> {
    store: Arc<S>,
    registry: HashMap<String, SequencedCollection>,
    reconciler: TypeReconciler<S>,
    rekeyer: TenantRekeyer<S>,
    cancel: Arc<AtomicBool>,
    metrics: Arc<MetricsRegistry>,
}

impl<S> MigrationService<S>
where
    S: SequenceStore + RecordRepository,
{
    /// Creates a service with default configuration and the `orders`
    /// collection registered (`order_number`, counter `orders`).
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ReconcileConfig::default(), RekeyConfig::default())
    }

    pub fn with_config(store: Arc<S>, reconcile: ReconcileConfig, rekey: RekeyConfig) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(MetricsRegistry::new());

        let reconciler = TypeReconciler::new(Arc::clone(&store), reconcile)
            .with_cancellation(Arc::clone(&cancel))
            .with_metrics(Arc::clone(&metrics));
        let rekeyer = TenantRekeyer::new(Arc::clone(&store), rekey)
            .with_cancellation(Arc::clone(&cancel))
            .with_metrics(Arc::clone(&metrics));

        let mut registry = HashMap::new();
        registry.insert(
            "orders".to_string(),
            SequencedCollection::new("orders", "order_number", "orders"),
        );

        Self {
            store,
            registry,
            reconciler,
            rekeyer,
            cancel,
            metrics,
        }
    }

    /// Registers (or replaces) a sequenced collection under `key`.
    pub fn register(&mut self, key: impl Into<String>, target: SequencedCollection) {
        self.registry.insert(key.into(), target);
    }

    pub fn sequenced(&self, key: &str) -> Result<&SequencedCollection, MigrationError> {
        self.registry
            .get(key)
            .ok_or_else(|| MigrationError::UnknownCollection(key.to_string()))
    }

    /// Flag that stops the current run at its next page or collection
    /// boundary. A request is consumed by the run it stops: the flag is
    /// cleared whenever a run returns, so the service stays usable.
    /// Setting it while idle stops the next run before it writes anything.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn run_type_reconciliation(
        &self,
        collection_key: &str,
    ) -> Result<MigrationReport, MigrationError> {
        let target = self.sequenced(collection_key)?;
        let result = self.reconciler.run(target);
        self.clear_cancellation();
        result
    }

    pub fn reconciliation_status(
        &self,
        collection_key: &str,
    ) -> Result<ReconciliationStatus, MigrationError> {
        let target = self.sequenced(collection_key)?;
        self.reconciler.status(target)
    }

    /// Rekeys every collection the backend reports. `confirm = false` is a
    /// dry run.
    pub fn run_tenant_rekey(
        &self,
        old_scope: &str,
        new_scope: &str,
        confirm: bool,
    ) -> Result<MigrationReport, MigrationError> {
        self.run_rekey_request(&RekeyRequest::new(old_scope, new_scope, confirm))
    }

    pub fn run_rekey_request(
        &self,
        request: &RekeyRequest,
    ) -> Result<MigrationReport, MigrationError> {
        let result = self.rekeyer.run(request);
        self.clear_cancellation();
        result
    }

    fn clear_cancellation(&self) {
        if self.cancel.swap(false, Ordering::SeqCst) {
            tracing::debug!("Cancellation request consumed");
        }
    }

    /// Allocates the next value for `counter`, recording the attempt.
    pub fn allocate(&self, counter: &str) -> Result<u64, SequenceError> {
        let result = self.store.allocate(counter);
        self.metrics.sequence.record_allocation(result.is_ok());
        result
    }

    pub fn peek(&self, counter: &str) -> Result<Option<u64>, SequenceError> {
        self.store.peek(counter)
    }
}
