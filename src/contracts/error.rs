use thiserror::Error;

use crate::contracts::report::MigrationReport;

/// Run-level failure of a migration operation.
///
/// Record- and collection-scoped problems never show up here; they are
/// recovered locally and land in the report's anomaly list.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Total loss of storage connectivity. The partial report is marked
    /// incomplete and must not be treated as final.
    #[error("Connection lost: {reason}")]
    Connection {
        reason: String,
        partial: Box<MigrationReport>,
    },

    #[error("Sequence store error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown collection key: {0}")]
    UnknownCollection(String),
}

impl MigrationError {
    /// Returns the incomplete report captured before the run aborted, if any.
    pub fn partial_report(&self) -> Option<&MigrationReport> {
        match self {
            MigrationError::Connection { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// True when the failure means the backend itself is gone, as opposed to
    /// one collection or record being unusable.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            MigrationError::Connection { .. } => true,
            MigrationError::Storage(e) => e.is_connection_loss(),
            MigrationError::Sequence(SequenceError::StoreUnavailable(_)) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    RocksDb(String),

    /// Backend unreachable or shut down. Fatal for the current run.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Transient lock conflict; safe to retry.
    #[error("Storage busy: {0}")]
    Busy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Schema mismatch in {collection}: {detail}")]
    SchemaMismatch { collection: String, detail: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// True when the whole backend is gone rather than one key or collection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// True for failures that are expected to clear on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum SequenceError {
    /// Counter backend unreachable after retries. The caller may retry the
    /// allocation but must never substitute a locally generated value.
    #[error("Sequence store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid sequence key: {0}")]
    InvalidKey(String),

    #[error("Corrupt watermark for {key}: {detail}")]
    Corrupt { key: String, detail: String },

    #[error("Sequence overflow")]
    Overflow,

    /// Non-transient backend failure. Not retryable and not a connection
    /// loss.
    #[error("Sequence store failure: {0}")]
    Backend(String),
}

impl From<StorageError> for SequenceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidInput(msg) => SequenceError::InvalidKey(msg),
            other @ (StorageError::Unavailable(_) | StorageError::Busy(_)) => {
                SequenceError::StoreUnavailable(other.to_string())
            }
            other => SequenceError::Backend(other.to_string()),
        }
    }
}
