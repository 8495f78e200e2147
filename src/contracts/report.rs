use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::contracts::repository::UpdateCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    TypeReconciliation,
    TenantRekey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Nothing was written; counts describe what a confirmed run would touch.
    DryRun,
    /// The run stopped early (connection loss or cancellation). Re-run it.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Sequence value could not be parsed as a non-negative integer.
    Parse,
    /// Conditional write lost against a concurrent writer.
    Stale,
    /// A single record's write failed; the record was left unchanged.
    Write,
    /// A collection's bulk update failed.
    CollectionUpdate,
    /// A collection-wide read or counter step failed; that step was skipped.
    Read,
    /// Two records share one sequence value.
    Duplicate,
    /// Post-run counts disagree with the expected end state.
    Verification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub detail: String,
}

/// How a JSON value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Number,
    String,
    Bool,
    Null,
    Array,
    Object,
}

impl Representation {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => Representation::Number,
            Value::String(_) => Representation::String,
            Value::Bool(_) => Representation::Bool,
            Value::Null => Representation::Null,
            Value::Array(_) => Representation::Array,
            Value::Object(_) => Representation::Object,
        }
    }
}

/// One record from the verification sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: String,
    pub value: Value,
    pub representation: Representation,
}

/// Per-collection result of a rekey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub collection: String,
    pub matched: u64,
    pub modified: u64,
    /// Documents left untouched because they could not be read or rewritten.
    #[serde(default)]
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionOutcome {
    /// Outcome of a bulk update that ran to the end of the collection. Any
    /// per-document failures are carried in the counts.
    pub fn succeeded(collection: &str, counts: UpdateCounts) -> Self {
        Self {
            collection: collection.to_string(),
            matched: counts.matched,
            modified: counts.modified,
            failed: counts.failed,
            error: (counts.failed > 0)
                .then(|| format!("{} documents could not be read or rewritten", counts.failed)),
        }
    }

    /// Outcome of a bulk update rejected before anything was written.
    pub fn failed(collection: &str, error: String) -> Self {
        Self {
            collection: collection.to_string(),
            matched: 0,
            modified: 0,
            failed: 0,
            error: Some(error),
        }
    }
}

/// Independently recomputed scope counts for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCounts {
    pub collection: String,
    pub old_scope: u64,
    pub new_scope: u64,
    pub total: u64,
}

/// Structured outcome of a reconciliation or rekey run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub operation: Operation,
    /// Collection key for reconciliation, `old -> new` for rekey.
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,

    pub scanned: u64,
    pub converted: u64,
    pub skipped: u64,
    pub stale: u64,

    pub collections: Vec<CollectionOutcome>,
    pub total_matched: u64,
    pub total_modified: u64,

    pub watermark_before: Option<u64>,
    pub watermark_after: Option<u64>,
    pub data_max: Option<u64>,

    pub sample: Vec<SampleRecord>,
    pub verification: Vec<VerificationCounts>,
    pub anomalies: Vec<Anomaly>,
    pub notes: Vec<String>,
}

impl MigrationReport {
    pub fn new(operation: Operation, target: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation,
            target: target.into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Incomplete,
            scanned: 0,
            converted: 0,
            skipped: 0,
            stale: 0,
            collections: Vec::new(),
            total_matched: 0,
            total_modified: 0,
            watermark_before: None,
            watermark_after: None,
            data_max: None,
            sample: Vec::new(),
            verification: Vec::new(),
            anomalies: Vec::new(),
            notes: Vec::new(),
        }
    }

    pub fn anomaly(
        &mut self,
        kind: AnomalyKind,
        collection: &str,
        record_id: Option<&str>,
        detail: impl Into<String>,
    ) {
        self.anomalies.push(Anomaly {
            kind,
            collection: collection.to_string(),
            record_id: record_id.map(String::from),
            detail: detail.into(),
        });
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Adds a collection outcome and folds its counts into the totals.
    pub fn push_collection(&mut self, outcome: CollectionOutcome) {
        self.total_matched += outcome.matched;
        self.total_modified += outcome.modified;
        self.collections.push(outcome);
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionOutcome> {
        self.collections.iter().find(|c| c.collection == name)
    }

    pub fn anomaly_count(&self, kind: AnomalyKind) -> usize {
        self.anomalies.iter().filter(|a| a.kind == kind).count()
    }

    /// Stamps the finish time and final outcome.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_final(&self) -> bool {
        self.outcome != RunOutcome::Incomplete
    }
}

/// Pre-flight view of a sequenced collection. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStatus {
    pub collection: String,
    pub field: String,
    pub counter: String,
    pub total_records: u64,
    pub non_conforming_count: u64,
    pub max_value: Option<u64>,
    pub max_value_type: Option<Representation>,
    pub watermark: Option<u64>,
}

impl ReconciliationStatus {
    /// True when every value is numeric and the watermark covers the data.
    pub fn is_conforming(&self) -> bool {
        self.non_conforming_count == 0
            && match self.max_value {
                Some(max) => self.watermark.is_some_and(|w| w >= max),
                None => true,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_report_is_incomplete_until_finished() {
        let mut report = MigrationReport::new(Operation::TypeReconciliation, "orders");
        assert!(!report.is_final());
        assert!(report.finished_at.is_none());

        report.finish(RunOutcome::Completed);
        assert!(report.is_final());
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn push_collection_accumulates_totals() {
        let mut report = MigrationReport::new(Operation::TenantRekey, "a -> b");
        report.push_collection(CollectionOutcome::succeeded(
            "orders",
            UpdateCounts {
                matched: 40,
                modified: 40,
                failed: 0,
            },
        ));
        report.push_collection(CollectionOutcome::failed("audit", "schema".into()));
        report.push_collection(CollectionOutcome::succeeded(
            "loads",
            UpdateCounts {
                matched: 3,
                modified: 2,
                failed: 0,
            },
        ));

        assert_eq!(report.total_matched, 43);
        assert_eq!(report.total_modified, 42);
        assert!(report.collection("loads").unwrap().error.is_none());
        assert_eq!(report.collection("audit").unwrap().error.as_deref(), Some("schema"));
    }

    #[test]
    fn report_serializes_snake_case_enums() {
        let mut report = MigrationReport::new(Operation::TenantRekey, "a -> b");
        report.anomaly(AnomalyKind::CollectionUpdate, "audit", None, "boom");
        report.finish(RunOutcome::DryRun);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["operation"], json!("tenant_rekey"));
        assert_eq!(json["outcome"], json!("dry_run"));
        assert_eq!(json["anomalies"][0]["kind"], json!("collection_update"));
        assert!(json["anomalies"][0].get("record_id").is_none());
    }

    #[test]
    fn status_conforms_only_when_watermark_covers_max() {
        let mut status = ReconciliationStatus {
            collection: "orders".into(),
            field: "order_number".into(),
            counter: "orders".into(),
            total_records: 3,
            non_conforming_count: 0,
            max_value: Some(12),
            max_value_type: Some(Representation::Number),
            watermark: Some(10),
        };
        assert!(!status.is_conforming());

        status.watermark = Some(12);
        assert!(status.is_conforming());

        status.non_conforming_count = 1;
        assert!(!status.is_conforming());
    }
}
