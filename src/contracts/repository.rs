use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contracts::error::StorageError;

/// Page size used by the default scan-based aggregates.
const DEFAULT_SCAN_PAGE: usize = 1000;

/// A schemaless document stored in a named collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Opaque primary key, independent of any sequence field.
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style setter for a dotted field path.
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set_path(path, value.into());
        self
    }

    /// Resolves a dotted path such as `carrier.tenant_id`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Sets a dotted path, creating intermediate objects as needed.
    /// Returns false when an intermediate segment exists but is not an object.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return false;
        };

        let mut current = &mut self.fields;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry {
                Value::Object(map) => current = map,
                _ => return false,
            }
        }
        current.insert(leaf.to_string(), value);
        true
    }
}

/// Reads a sequence value from either representation.
///
/// Numbers must be non-negative integers; strings must trim to one.
/// Anything else yields `None`.
pub fn parse_sequence_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Predicate evaluated by the repository when scanning a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Field equals the given value exactly.
    Eq { field: String, value: Value },
    /// Field is present and not stored as a JSON number.
    NonNumeric { field: String },
    /// Field is present and stored as a JSON number.
    Numeric { field: String },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn non_numeric(field: impl Into<String>) -> Self {
        Filter::NonNumeric {
            field: field.into(),
        }
    }

    pub fn numeric(field: impl Into<String>) -> Self {
        Filter::Numeric {
            field: field.into(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => doc.get_path(field) == Some(value),
            Filter::NonNumeric { field } => doc.get_path(field).is_some_and(|v| !v.is_number()),
            Filter::Numeric { field } => doc.get_path(field).is_some_and(Value::is_number),
        }
    }
}

/// Result of a per-document conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The field no longer held the expected value.
    Stale,
    /// The document disappeared before the write.
    Missing,
}

/// Matched vs. modified counts from a filtered bulk update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCounts {
    pub matched: u64,
    pub modified: u64,
    /// Documents that could not be decoded or rewritten. They keep their old
    /// value and the scan continues past them.
    #[serde(default)]
    pub failed: u64,
}

/// Storage substrate for collections of documents.
///
/// Implementations never cache documents across calls; every read and
/// write goes to the backend.
///
/// # Invariants
/// - `replace_field_if` touches exactly one document and only when the field
///   still holds the expected value
/// - `update_many` rewrites only documents matching the filter, one at a time
/// - `find_page` returns documents ordered by id, strictly after `after_id`
pub trait RecordRepository: Send + Sync {
    /// Lists every collection currently present in the backend.
    fn list_collections(&self) -> Result<Vec<String>, StorageError>;

    /// Inserts or overwrites a document.
    fn insert(&self, collection: &str, doc: &Document) -> Result<(), StorageError>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError>;

    /// Returns up to `limit` matching documents with ids greater than `after_id`.
    fn find_page(
        &self,
        collection: &str,
        filter: &Filter,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StorageError>;

    /// Replaces `field` with `new` only if it still equals `expected`.
    fn replace_field_if(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        expected: &Value,
        new: Value,
    ) -> Result<WriteOutcome, StorageError>;

    /// Rewrites `field` from `from` to `to` on every matching document.
    ///
    /// Per-document failures are counted in `UpdateCounts::failed` and do not
    /// stop the scan. Errors are returned only when the collection as a whole
    /// cannot be updated, and then nothing has been written.
    fn update_many(
        &self,
        collection: &str,
        field: &str,
        from: &Value,
        to: &Value,
    ) -> Result<UpdateCounts, StorageError>;

    /// Counts matching documents.
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let mut total = 0u64;
        self.scan(collection, filter, |_| total += 1)?;
        Ok(total)
    }

    /// Largest sequence value in `field` across the collection, whichever
    /// representation it is stored under.
    fn max_sequence(&self, collection: &str, field: &str) -> Result<Option<u64>, StorageError> {
        let mut max: Option<u64> = None;
        self.scan(collection, &Filter::All, |doc| {
            if let Some(v) = doc.get_path(field).and_then(parse_sequence_value) {
                max = max.max(Some(v));
            }
        })?;
        Ok(max)
    }

    /// The `n` documents with the largest sequence values, descending.
    fn top_by_sequence(
        &self,
        collection: &str,
        field: &str,
        n: usize,
    ) -> Result<Vec<Document>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut heap: BinaryHeap<Reverse<(u64, String)>> = BinaryHeap::with_capacity(n + 1);
        let mut kept: HashMap<String, Document> = HashMap::new();

        self.scan(collection, &Filter::All, |doc| {
            let Some(v) = doc.get_path(field).and_then(parse_sequence_value) else {
                return;
            };
            heap.push(Reverse((v, doc.id.clone())));
            kept.insert(doc.id.clone(), doc);
            if heap.len() > n {
                if let Some(Reverse((_, evicted))) = heap.pop() {
                    kept.remove(&evicted);
                }
            }
        })?;

        let mut ranked: Vec<(u64, String)> = heap.into_iter().map(|Reverse(e)| e).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        Ok(ranked
            .into_iter()
            .filter_map(|(_, id)| kept.remove(&id))
            .collect())
    }

    /// Visits every matching document page by page.
    fn scan<F>(&self, collection: &str, filter: &Filter, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(Document),
    {
        let mut after: Option<String> = None;
        loop {
            let page = self.find_page(collection, filter, after.as_deref(), DEFAULT_SCAN_PAGE)?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(last.id.clone());
            let full = page.len() == DEFAULT_SCAN_PAGE;
            page.into_iter().for_each(&mut visit);
            if !full {
                return Ok(());
            }
        }
    }
}
