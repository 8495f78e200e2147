//! Run metrics for seqkeep.
//!
//! Counters are lock-free atomics; a binary run can dump them in Prometheus
//! text format for a node-exporter textfile collector.

pub mod histogram;
pub mod registry;

pub use histogram::Histogram;
pub use registry::{MetricsRegistry, ReconcileMetrics, RekeyMetrics, SequenceMetrics};
