//! Lock-free histogram for batch step durations.
//!
//! Buckets are in milliseconds and sized for storage round-trips and page
//! processing, from a single conditional write up to a slow full-page scan.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Fixed histogram buckets in milliseconds.
pub const HISTOGRAM_BUCKETS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 1_000, 5_000, 30_000];

/// Thread-safe histogram with cumulative buckets, rendered in Prometheus
/// exposition format.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use seqkeep::metrics::Histogram;
///
/// let histogram = Histogram::new();
/// histogram.observe(Duration::from_millis(12));
///
/// let (sum, count, _) = histogram.snapshot();
/// assert_eq!(count, 1);
/// assert_eq!(sum, 12);
/// ```
pub struct Histogram {
    sum_ms: AtomicU64,
    count: AtomicU64,
    buckets: [AtomicU64; 10],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: [ZERO; 10],
        }
    }

    #[inline]
    pub fn observe(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &boundary) in HISTOGRAM_BUCKETS_MS.iter().enumerate() {
            if ms <= boundary {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns `(sum_ms, count, cumulative_buckets)`.
    pub fn snapshot(&self) -> (u64, u64, [u64; 10]) {
        let mut buckets = [0u64; 10];
        for (i, bucket) in self.buckets.iter().enumerate() {
            buckets[i] = bucket.load(Ordering::Relaxed);
        }
        (
            self.sum_ms.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
            buckets,
        )
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn format_prometheus(&self, name: &str, help: &str) -> String {
        let (sum, count, buckets) = self.snapshot();
        let mut output = String::with_capacity(768);

        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} histogram", name);
        for (i, &boundary) in HISTOGRAM_BUCKETS_MS.iter().enumerate() {
            let _ = writeln!(
                output,
                "{}_bucket{{le=\"{}\"}} {}",
                name, boundary, buckets[i]
            );
        }
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(output, "{}_sum {}", name, sum);
        let _ = writeln!(output, "{}_count {}", name, count);

        output
    }
}
