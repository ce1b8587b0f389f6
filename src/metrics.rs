//! Operation counters for the storage engine.
//!
//! Counters are plain atomics, incremented from the sequencer and the I/O
//! pools, and read through [`StorageMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one storage instance.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    retrieves: AtomicU64,
    retrieve_hits: AtomicU64,
    retrieve_misses: AtomicU64,
    memory_hits: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
    header_updates: AtomicU64,
    removals: AtomicU64,
    corrupt_entries: AtomicU64,
    shrinks: AtomicU64,
    files_swept: AtomicU64,
    files_deleted: AtomicU64,
}

macro_rules! counter {
    ($incr:ident, $field:ident) => {
        pub(crate) fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl StorageMetrics {
    counter!(incr_retrieves, retrieves);
    counter!(incr_retrieve_hits, retrieve_hits);
    counter!(incr_retrieve_misses, retrieve_misses);
    counter!(incr_memory_hits, memory_hits);
    counter!(incr_stores, stores);
    counter!(incr_store_failures, store_failures);
    counter!(incr_header_updates, header_updates);
    counter!(incr_removals, removals);
    counter!(incr_corrupt_entries, corrupt_entries);
    counter!(incr_shrinks, shrinks);
    counter!(incr_files_swept, files_swept);
    counter!(incr_files_deleted, files_deleted);

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            retrieves: self.retrieves.load(Ordering::Relaxed),
            retrieve_hits: self.retrieve_hits.load(Ordering::Relaxed),
            retrieve_misses: self.retrieve_misses.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            header_updates: self.header_updates.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            shrinks: self.shrinks.load(Ordering::Relaxed),
            files_swept: self.files_swept.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Retrieve operations issued.
    pub retrieves: u64,
    /// Retrieves that produced an entry.
    pub retrieve_hits: u64,
    /// Retrieves that produced no entry.
    pub retrieve_misses: u64,
    /// Retrieves satisfied from an in-flight write.
    pub memory_hits: u64,
    /// Store and update operations issued.
    pub stores: u64,
    /// Stores that failed or were rejected.
    pub store_failures: u64,
    /// Updates that took the in-place header path.
    pub header_updates: u64,
    /// Entries removed (explicitly or after corruption).
    pub removals: u64,
    /// Records that failed decoding or checksum verification.
    pub corrupt_entries: u64,
    /// Shrink sweeps started.
    pub shrinks: u64,
    /// Files visited by shrink sweeps.
    pub files_swept: u64,
    /// Files deleted by shrink sweeps.
    pub files_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = StorageMetrics::default();
        metrics.incr_retrieves();
        metrics.incr_retrieves();
        metrics.incr_retrieve_hits();
        metrics.incr_shrinks();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retrieves, 2);
        assert_eq!(snapshot.retrieve_hits, 1);
        assert_eq!(snapshot.shrinks, 1);
        assert_eq!(snapshot.stores, 0);
    }

    #[test]
    fn test_default_snapshot_is_zero() {
        assert_eq!(
            StorageMetrics::default().snapshot(),
            MetricsSnapshot::default()
        );
    }
}
