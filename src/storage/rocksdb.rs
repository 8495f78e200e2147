use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use rocksdb::{
    BlockBasedOptions, Direction, ErrorKind, IteratorMode, MultiThreaded, Options, ReadOptions,
    TransactionDB, TransactionDBOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{
    Document, Filter, RecordRepository, SequenceError, SequenceStore, StorageError, UpdateCounts,
    WriteOutcome,
};
use crate::storage::retry::{with_retry, RetryConfig};

/// Key prefix for sequence counters
const COUNTER_PREFIX: &str = "ctr";
/// Key prefix for the collection registry
const COLLECTION_PREFIX: &str = "col";
/// Key prefix for document data
const DOC_PREFIX: &str = "doc";

/// How long a transaction waits on a row lock before reporting busy.
const LOCK_TIMEOUT_MS: i64 = 1_000;

/// Per-collection settings persisted in the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Fields whose values may never be rewritten in place (e.g. append-only
    /// audit trails). Writes touching them fail with a schema mismatch.
    #[serde(default)]
    pub locked_fields: Vec<String>,
}

/// RocksDB-backed store for both sequence counters and document collections.
///
/// Every mutation runs in a pessimistic transaction so that counter
/// increments and conditional document writes are atomic at the storage
/// level, independent of any in-process locking.
pub struct RocksDbStore {
    db: TransactionDB<MultiThreaded>,
    /// Known collection names (mirrors the `col:` registry on disk)
    collections: DashSet<String>,
    retry: RetryConfig,
    /// Cleared by `shutdown`; every call fails with `Unavailable` afterwards.
    open: AtomicBool,
}

impl RocksDbStore {
    /// Opens or creates a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_retry(path, RetryConfig::default())
    }

    /// Opens a store with an explicit retry policy for lock contention.
    pub fn open_with_retry(
        path: impl AsRef<Path>,
        retry: RetryConfig,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get() as i32)
            .unwrap_or(4);
        opts.increase_parallelism(parallelism);
        opts.set_max_background_jobs(parallelism.min(4));

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(64 * 1024 * 1024));
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(LOCK_TIMEOUT_MS);

        let db = TransactionDB::<MultiThreaded>::open(&opts, &txn_opts, path)
            .map_err(map_rocksdb_err)?;

        let store = Self {
            db,
            collections: DashSet::new(),
            retry,
            open: AtomicBool::new(true),
        };
        store.load_collection_registry()?;

        tracing::info!(
            path = %path.display(),
            collections = store.collections.len(),
            "Opened RocksDB store"
        );
        Ok(store)
    }

    /// Stops serving requests. Subsequent calls fail as if the backend
    /// connection had been lost.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        tracing::info!("RocksDB store shut down");
    }

    /// Writes raw bytes under a document key, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn put_raw_document(&self, collection: &str, id: &str, bytes: &[u8]) {
        self.db
            .put(Self::doc_key(collection, id).as_bytes(), bytes)
            .unwrap();
    }

    /// Registers a collection with explicit options (overwrites existing options).
    pub fn create_collection(
        &self,
        name: &str,
        options: &CollectionOptions,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        Self::validate_collection(name)?;
        let bytes = serde_json::to_vec(options)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.db
            .put(Self::collection_key(name).as_bytes(), bytes)
            .map_err(map_rocksdb_err)?;
        self.collections.insert(name.to_string());
        Ok(())
    }

    fn load_collection_registry(&self) -> Result<(), StorageError> {
        let prefix = format!("{}:", COLLECTION_PREFIX);
        let iter = self.db.iterator(IteratorMode::From(
            prefix.as_bytes(),
            Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item.map_err(map_rocksdb_err)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let name = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            self.collections.insert(name);
        }
        Ok(())
    }

    fn collection_options(&self, name: &str) -> Result<CollectionOptions, StorageError> {
        match self
            .db
            .get(Self::collection_key(name).as_bytes())
            .map_err(map_rocksdb_err)?
        {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            _ => Ok(CollectionOptions::default()),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("store has been shut down".into()))
        }
    }

    fn ensure_collection(&self, name: &str) -> Result<(), StorageError> {
        if self.collections.contains(name) {
            Ok(())
        } else {
            Err(StorageError::CollectionNotFound(name.to_string()))
        }
    }

    fn validate_collection(name: &str) -> Result<(), StorageError> {
        if name.is_empty() || name.contains(':') {
            return Err(StorageError::InvalidInput(format!(
                "invalid collection name '{}'",
                name
            )));
        }
        Ok(())
    }

    fn validate_counter(key: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidInput("empty sequence key".into()));
        }
        Ok(())
    }

    fn counter_key(key: &str) -> String {
        format!("{}:{}", COUNTER_PREFIX, key)
    }

    fn collection_key(name: &str) -> String {
        format!("{}:{}", COLLECTION_PREFIX, name)
    }

    /// Creates a document key. Format: doc:{collection}:{id}
    fn doc_key(collection: &str, id: &str) -> String {
        format!("{}:{}:{}", DOC_PREFIX, collection, id)
    }

    fn doc_prefix(collection: &str) -> String {
        format!("{}:{}:", DOC_PREFIX, collection)
    }

    /// ';' sorts directly after ':', bounding the scan to one collection.
    fn doc_upper_bound(collection: &str) -> Vec<u8> {
        format!("{}:{};", DOC_PREFIX, collection).into_bytes()
    }

    fn read_options_with_bound(upper_bound: Vec<u8>) -> ReadOptions {
        let mut opts = ReadOptions::default();
        opts.fill_cache(false);
        opts.set_iterate_upper_bound(upper_bound);
        opts
    }

    fn encode_doc(doc: &Document) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(doc).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode_doc(collection: &str, bytes: &[u8]) -> Result<Document, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Serialization(format!("corrupt document in {}: {}", collection, e))
        })
    }

    #[inline]
    fn parse_u64_be(bytes: &[u8]) -> Result<u64, StorageError> {
        bytes
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| StorageError::Serialization("Invalid u64 bytes".into()))
    }

    fn check_locked(
        options: &CollectionOptions,
        collection: &str,
        field: &str,
    ) -> Result<(), StorageError> {
        if options.locked_fields.iter().any(|f| f == field) {
            return Err(StorageError::SchemaMismatch {
                collection: collection.to_string(),
                detail: format!("field '{}' is locked against rewrites", field),
            });
        }
        Ok(())
    }

    /// Reads the counter row under an exclusive lock, lets `next` compute the
    /// new watermark, and commits it. Returns the committed value.
    fn update_counter<F>(&self, key: &str, next: F) -> Result<u64, SequenceError>
    where
        F: Fn(Option<u64>) -> Result<Option<u64>, SequenceError>,
    {
        self.ensure_open()?;
        Self::validate_counter(key)?;
        let db_key = Self::counter_key(key);

        let mut outcome: Result<u64, SequenceError> = Err(SequenceError::Overflow);
        with_retry(&self.retry, "counter update", || {
            self.ensure_open()?;
            let txn = self.db.transaction();
            let current = txn
                .get_for_update(db_key.as_bytes(), true)
                .map_err(map_rocksdb_err)?
                .map(|b| Self::parse_u64_be(&b))
                .transpose()?;

            match next(current) {
                Ok(Some(value)) => {
                    txn.put(db_key.as_bytes(), value.to_be_bytes())
                        .map_err(map_rocksdb_err)?;
                    txn.commit().map_err(map_rocksdb_err)?;
                    outcome = Ok(value);
                }
                // Nothing to write; the lock is released on drop.
                Ok(None) => outcome = Ok(current.unwrap_or(0)),
                Err(e) => outcome = Err(e),
            }
            Ok(())
        })
        .map_err(|e| match e {
            StorageError::Serialization(detail) => SequenceError::Corrupt {
                key: key.to_string(),
                detail,
            },
            other => SequenceError::from(other),
        })?;
        outcome
    }

    /// Rewrites one field of one document inside a transaction.
    fn conditional_write(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        expected: &Value,
        new: &Value,
    ) -> Result<WriteOutcome, StorageError> {
        let key = Self::doc_key(collection, id);
        with_retry(&self.retry, "conditional write", || {
            self.ensure_open()?;
            let txn = self.db.transaction();
            let Some(bytes) = txn
                .get_for_update(key.as_bytes(), true)
                .map_err(map_rocksdb_err)?
            else {
                return Ok(WriteOutcome::Missing);
            };
            let mut doc = Self::decode_doc(collection, &bytes)?;
            if doc.get_path(field) != Some(expected) {
                return Ok(WriteOutcome::Stale);
            }
            if !doc.set_path(field, new.clone()) {
                return Err(StorageError::SchemaMismatch {
                    collection: collection.to_string(),
                    detail: format!("cannot set '{}' on document {}", field, id),
                });
            }
            txn.put(key.as_bytes(), Self::encode_doc(&doc)?)
                .map_err(map_rocksdb_err)?;
            txn.commit().map_err(map_rocksdb_err)?;
            Ok(WriteOutcome::Applied)
        })
    }
}

/// Maps RocksDB status codes onto the storage error taxonomy.
fn map_rocksdb_err(e: rocksdb::Error) -> StorageError {
    match e.kind() {
        ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
            StorageError::Busy(e.to_string())
        }
        ErrorKind::IOError | ErrorKind::ShutdownInProgress => {
            StorageError::Unavailable(e.to_string())
        }
        _ => StorageError::RocksDb(e.to_string()),
    }
}

impl SequenceStore for RocksDbStore {
    fn allocate(&self, key: &str) -> Result<u64, SequenceError> {
        self.update_counter(key, |current| {
            current
                .unwrap_or(0)
                .checked_add(1)
                .map(Some)
                .ok_or(SequenceError::Overflow)
        })
    }

    fn peek(&self, key: &str) -> Result<Option<u64>, SequenceError> {
        self.ensure_open()?;
        Self::validate_counter(key)?;
        let db_key = Self::counter_key(key);
        match self.db.get(db_key.as_bytes()).map_err(map_rocksdb_err)? {
            Some(bytes) => Self::parse_u64_be(&bytes)
                .map(Some)
                .map_err(|e| SequenceError::Corrupt {
                    key: key.to_string(),
                    detail: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn advance_to(&self, key: &str, value: u64) -> Result<u64, SequenceError> {
        let result = self.update_counter(key, |current| match current {
            Some(c) if c >= value => Ok(None),
            _ => Ok(Some(value)),
        })?;
        tracing::debug!(key = key, requested = value, watermark = result, "advance_to");
        Ok(result)
    }
}

impl RecordRepository for RocksDbStore {
    fn list_collections(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        let mut result: Vec<String> = self.collections.iter().map(|c| c.key().clone()).collect();
        result.sort();
        Ok(result)
    }

    fn insert(&self, collection: &str, doc: &Document) -> Result<(), StorageError> {
        self.ensure_open()?;
        Self::validate_collection(collection)?;
        if doc.id.is_empty() {
            return Err(StorageError::InvalidInput("empty document id".into()));
        }
        if !self.collections.contains(collection) {
            let key = Self::collection_key(collection);
            if self.db.get(key.as_bytes()).map_err(map_rocksdb_err)?.is_none() {
                self.db.put(key.as_bytes(), b"").map_err(map_rocksdb_err)?;
            }
            self.collections.insert(collection.to_string());
        }
        let key = Self::doc_key(collection, &doc.id);
        let bytes = Self::encode_doc(doc)?;
        with_retry(&self.retry, "insert", || {
            self.ensure_open()?;
            self.db
                .put(key.as_bytes(), &bytes)
                .map_err(map_rocksdb_err)
        })
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        self.ensure_open()?;
        let key = Self::doc_key(collection, id);
        self.db
            .get(key.as_bytes())
            .map_err(map_rocksdb_err)?
            .map(|bytes| Self::decode_doc(collection, &bytes))
            .transpose()
    }

    fn find_page(
        &self,
        collection: &str,
        filter: &Filter,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>, StorageError> {
        self.ensure_open()?;
        self.ensure_collection(collection)?;

        let mut docs = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(docs);
        }

        let prefix = Self::doc_prefix(collection);
        let start = match after_id {
            Some(after) => Self::doc_key(collection, after),
            None => prefix.clone(),
        };
        let read_opts = Self::read_options_with_bound(Self::doc_upper_bound(collection));
        let iter = self.db.iterator_opt(
            IteratorMode::From(start.as_bytes(), Direction::Forward),
            read_opts,
        );

        for item in iter {
            let (key, value) = item.map_err(map_rocksdb_err)?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let doc = match Self::decode_doc(collection, &value) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "Skipping undecodable document"
                    );
                    counts.failed += 1;
                    continue;
                }
            };
            if !filter.matches(&doc) {
                continue;
            }
            if !checked_lock {
                Self::check_locked(&self.collection_options(collection)?, collection, field)?;
                checked_lock = true;
            }
            counts.matched += 1;
            if from == to {
                continue;
            }
            match self.conditional_write(collection, &doc.id, field, from, to) {
                Ok(WriteOutcome::Applied) => counts.modified += 1,
                Ok(_) => {}
                Err(e) if e.is_connection_loss() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        collection = collection,
                        id = %doc.id,
                        error = %e,
                        "Document rewrite failed"
                    );
                    counts.failed += 1;
                }
            }
        }

        tracing::debug!(
            collection = collection,
            field = field,
            matched = counts.matched,
            modified = counts.modified,
            failed = counts.failed,
            "update_many"
        );
        Ok(counts)
    }
}
