use crate::contracts::error::SequenceError;

/// Durable, per-key monotonic counter.
///
/// # Invariants
/// - The watermark for a key never decreases
/// - `allocate` persists the new watermark before returning it, so two
///   callers never observe the same value for one key
/// - Counters are created lazily at 0 and are never deleted
pub trait SequenceStore: Send + Sync {
    /// Atomically increments the watermark for `key` and returns the new value.
    fn allocate(&self, key: &str) -> Result<u64, SequenceError>;

    /// Returns the current watermark, or `None` if `key` was never allocated.
    fn peek(&self, key: &str) -> Result<Option<u64>, SequenceError>;

    /// Raises the watermark to `max(current, value)` and returns the result.
    /// Never moves the watermark backward.
    fn advance_to(&self, key: &str, value: u64) -> Result<u64, SequenceError>;
}
