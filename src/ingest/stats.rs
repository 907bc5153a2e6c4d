use std::sync::atomic::{AtomicU64, Ordering};

use super::record::{RecordKind, RECORD_KIND_COUNT};

/// Lock-free per-RecordKind counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct IngestStats {
    counts: [AtomicU64; RECORD_KIND_COUNT],
}

impl IngestStats {
    /// Create a new zeroed IngestStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given record kind by one.
    pub fn record(&self, kind: RecordKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(RecordKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = RecordKind::from_index(i) {
                    result.push((kind, v));
                }
            }
        }

        result
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}
