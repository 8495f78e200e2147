pub mod contracts;
pub mod metrics;
pub mod reconcile;
pub mod storage;
