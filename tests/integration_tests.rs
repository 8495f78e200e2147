//! End-to-end tests for reconciliation and rekey through `MigrationService`.
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use seqkeep::contracts::{
    AnomalyKind, Document, Filter, MigrationError, RecordRepository, Representation, RunOutcome,
    SequenceStore,
};
use seqkeep::reconcile::{MigrationService, RekeyConfig, RekeyRequest, ReconcileConfig};
use seqkeep::storage::{CollectionOptions, RocksDbStore};

fn create_test_service() -> (MigrationService<RocksDbStore>, Arc<RocksDbStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    let service = MigrationService::new(Arc::clone(&store));
    (service, store, dir)
}

fn insert_order(store: &RocksDbStore, id: &str, number: Value) {
    let doc = Document::new(id)
        .with("order_number", number)
        .with("tenant_id", "acme");
    store.insert("orders", &doc).unwrap();
}

fn insert_scoped(store: &RocksDbStore, collection: &str, count: usize, tenant: &str) {
    for i in 0..count {
        let doc = Document::new(format!("{}-{}", tenant, i)).with("tenant_id", tenant);
        store.insert(collection, &doc).unwrap();
    }
}

// =============================================================================
// Type Reconciliation
// =============================================================================

/// Two string values and one number, watermark behind the data.
#[test]
fn reconciliation_converts_strings_and_repairs_watermark() {
    let (service, store, _dir) = create_test_service();
    insert_order(&store, "a", json!("5"));
    insert_order(&store, "b", json!("12"));
    insert_order(&store, "c", json!(7));
    store.advance_to("orders", 10).unwrap();

    let report = service.run_type_reconciliation("orders").unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.converted, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.watermark_before, Some(10));
    assert_eq!(report.watermark_after, Some(12));
    assert_eq!(store.peek("orders").unwrap(), Some(12));

    for (id, expected) in [("a", 5), ("b", 12), ("c", 7)] {
        let doc = store.get("orders", id).unwrap().unwrap();
        assert_eq!(doc.get_path("order_number"), Some(&json!(expected)));
        assert_eq!(doc.get_path("tenant_id"), Some(&json!("acme")));
    }

    // The next order must not collide with the converted data
    assert_eq!(service.allocate("orders").unwrap(), 13);
}

#[test]
fn reconciliation_is_idempotent() {
    let (service, store, _dir) = create_test_service();
    insert_order(&store, "a", json!("5"));
    insert_order(&store, "b", json!("x"));

    let first = service.run_type_reconciliation("orders").unwrap();
    assert_eq!(first.converted, 1);
    assert_eq!(first.skipped, 1);

    let second = service.run_type_reconciliation("orders").unwrap();
    assert_eq!(second.converted, 0);
    // the malformed record is still the only non-numeric one
    assert_eq!(second.skipped, 1);
    assert_eq!(second.anomaly_count(AnomalyKind::Parse), 1);
}

#[test]
fn reconciled_collection_satisfies_invariant() {
    let (service, store, _dir) = create_test_service();
    for i in 0..50u64 {
        let value = if i % 3 == 0 { json!(i) } else { json!(format!(" {} ", i)) };
        insert_order(&store, &format!("o-{:03}", i), value);
    }

    let report = service.run_type_reconciliation("orders").unwrap();
    assert_eq!(report.converted + 17, 50);

    assert_eq!(
        store
            .count("orders", &Filter::non_numeric("order_number"))
            .unwrap(),
        0
    );
    let max = store.max_sequence("orders", "order_number").unwrap().unwrap();
    assert!(max <= store.peek("orders").unwrap().unwrap());
    assert!(report
        .sample
        .iter()
        .all(|s| s.representation == Representation::Number));
}

#[test]
fn empty_collection_reports_zero_counts() {
    let (service, _store, _dir) = create_test_service();
    let report = service.run_type_reconciliation("orders").unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.scanned, 0);
    assert_eq!(report.converted, 0);
    assert!(report.anomalies.is_empty());
}

#[test]
fn status_reflects_before_and_after() {
    let (service, store, _dir) = create_test_service();
    insert_order(&store, "a", json!("20"));
    insert_order(&store, "b", json!(3));

    let before = service.reconciliation_status("orders").unwrap();
    assert_eq!(before.total_records, 2);
    assert_eq!(before.non_conforming_count, 1);
    assert_eq!(before.max_value, Some(20));
    assert_eq!(before.max_value_type, Some(Representation::String));
    assert_eq!(before.watermark, None);
    assert!(!before.is_conforming());

    service.run_type_reconciliation("orders").unwrap();

    let after = service.reconciliation_status("orders").unwrap();
    assert_eq!(after.non_conforming_count, 0);
    assert_eq!(after.max_value_type, Some(Representation::Number));
    assert_eq!(after.watermark, Some(20));
    assert!(after.is_conforming());
}

#[test]
fn report_serializes_for_operators() {
    let (service, store, _dir) = create_test_service();
    insert_order(&store, "a", json!("bad"));

    let report = service.run_type_reconciliation("orders").unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["operation"], json!("type_reconciliation"));
    assert_eq!(json["outcome"], json!("completed"));
    assert_eq!(json["anomalies"][0]["kind"], json!("parse"));
    assert_eq!(json["anomalies"][0]["record_id"], json!("a"));
}

#[test]
fn small_page_size_processes_large_collection() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    let service = MigrationService::with_config(
        Arc::clone(&store),
        ReconcileConfig {
            page_size: 7,
            sample_size: 3,
            ..ReconcileConfig::default()
        },
        RekeyConfig::default(),
    );
    for i in 0..100u64 {
        insert_order(&store, &format!("o-{:03}", i), json!((i + 1).to_string()));
    }

    let report = service.run_type_reconciliation("orders").unwrap();
    assert_eq!(report.scanned, 100);
    assert_eq!(report.converted, 100);
    assert_eq!(report.watermark_after, Some(100));
    let top: Vec<Value> = report.sample.iter().map(|s| s.value.clone()).collect();
    assert_eq!(top, vec![json!(100), json!(99), json!(98)]);
}

// =============================================================================
// Tenant Rekey
// =============================================================================

#[test]
fn rekey_moves_orders_and_leaves_customers() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 40, "legacy_tenant_001");
    insert_scoped(&store, "customers", 5, "someone-else");

    let report = service
        .run_tenant_rekey("legacy_tenant_001", "cross-miles-carrier-inc", true)
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.collection("orders").unwrap().modified, 40);
    assert_eq!(report.collection("customers").unwrap().modified, 0);
    assert_eq!(report.total_modified, 40);

    for v in &report.verification {
        assert_eq!(v.old_scope, 0, "{} still has old scope", v.collection);
    }
    let orders = report
        .verification
        .iter()
        .find(|v| v.collection == "orders")
        .unwrap();
    assert_eq!(orders.new_scope, 40);
    assert_eq!(
        store
            .count("customers", &Filter::eq("tenant_id", "someone-else"))
            .unwrap(),
        5
    );
}

#[test]
fn rekey_dry_run_requires_confirmation() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 3, "old");

    let report = service.run_tenant_rekey("old", "new", false).unwrap();
    assert_eq!(report.outcome, RunOutcome::DryRun);
    assert_eq!(report.collection("orders").unwrap().matched, 3);
    assert_eq!(report.total_modified, 0);
    assert!(report.notes.iter().any(|n| n.contains("confirmation required")));
    assert_eq!(
        store.count("orders", &Filter::eq("tenant_id", "old")).unwrap(),
        3
    );
}

#[test]
fn rekey_is_idempotent() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 6, "old");
    insert_scoped(&store, "loads", 2, "old");

    let first = service.run_tenant_rekey("old", "new", true).unwrap();
    assert_eq!(first.total_modified, 8);

    let second = service.run_tenant_rekey("old", "new", true).unwrap();
    assert_eq!(second.total_matched, 0);
    assert_eq!(second.total_modified, 0);
    assert!(second.anomalies.is_empty());
}

/// One of five collections refuses the update; the rest still move.
#[test]
fn rekey_tolerates_one_failing_collection() {
    let (service, store, _dir) = create_test_service();
    store
        .create_collection(
            "drivers",
            &CollectionOptions {
                locked_fields: vec!["tenant_id".into()],
            },
        )
        .unwrap();
    for collection in ["orders", "customers", "carriers", "drivers", "loads"] {
        insert_scoped(&store, collection, 4, "old");
    }

    let report = service.run_tenant_rekey("old", "new", true).unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    for collection in ["orders", "customers", "carriers", "loads"] {
        let outcome = report.collection(collection).unwrap();
        assert_eq!(outcome.modified, 4, "{} should be rekeyed", collection);
        assert!(outcome.error.is_none());
    }
    assert!(report.collection("drivers").unwrap().error.is_some());
    assert_eq!(report.total_modified, 16);

    let failures: Vec<_> = report
        .anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::CollectionUpdate)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].collection, "drivers");
    assert_eq!(report.anomaly_count(AnomalyKind::Verification), 1);
}

#[test]
fn rekey_skips_documents_without_scope_field() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 2, "old");
    store
        .insert("settings", &Document::new("global").with("theme", "dark"))
        .unwrap();

    let report = service.run_tenant_rekey("old", "new", true).unwrap();
    let settings = report.collection("settings").unwrap();
    assert_eq!(settings.matched, 0);
    assert!(settings.error.is_none());
    assert_eq!(
        store.get("settings", "global").unwrap().unwrap().get_path("theme"),
        Some(&json!("dark"))
    );
}

#[test]
fn rekey_with_explicit_collections() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 2, "old");
    insert_scoped(&store, "invoices", 2, "old");

    let request = RekeyRequest::new("old", "new", true).with_collections(vec!["invoices".into()]);
    let report = service.run_rekey_request(&request).unwrap();

    assert_eq!(report.collection("invoices").unwrap().modified, 2);
    assert!(report.collection("orders").is_none());
    assert_eq!(
        store.count("orders", &Filter::eq("tenant_id", "old")).unwrap(),
        2
    );
}

#[test]
fn rekey_rejects_same_scope() {
    let (service, _store, _dir) = create_test_service();
    assert!(matches!(
        service.run_tenant_rekey("t1", "t1", true),
        Err(MigrationError::InvalidRequest(_))
    ));
}

// =============================================================================
// Connection Loss
// =============================================================================

#[test]
fn lost_store_yields_incomplete_report() {
    let (service, store, _dir) = create_test_service();
    insert_scoped(&store, "orders", 2, "old");
    store.shutdown();

    match service.run_tenant_rekey("old", "new", true) {
        Err(MigrationError::Connection { partial, .. }) => {
            assert_eq!(partial.outcome, RunOutcome::Incomplete);
            assert!(!partial.is_final());
        }
        other => panic!("expected connection error, got {:?}", other),
    }
}
