pub mod error;
pub mod report;
pub mod repository;
pub mod sequence;

pub use error::{MigrationError, SequenceError, StorageError};
pub use report::{
    Anomaly, AnomalyKind, CollectionOutcome, MigrationReport, Operation, ReconciliationStatus,
    Representation, RunOutcome, SampleRecord, VerificationCounts,
};
pub use repository::{
    parse_sequence_value, Document, Filter, RecordRepository, UpdateCounts, WriteOutcome,
};
pub use sequence::SequenceStore;
