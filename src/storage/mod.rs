//! Tiered offline storage for telemetry records.
//!
//! Two-tier architecture:
//! - **Memory**: bounded in-process queue, the primary write target
//! - **Disk**: SQLite database, durable across restarts
//!
//! [`TieredStorage`] writes into memory, flushes memory into disk once the
//! memory quota is exceeded, and leases records to the upload pipeline from
//! memory first, then disk.

pub mod flush_worker;
pub mod memory_storage;
pub mod sqlite_storage;
pub mod tiered;
pub mod types;

pub use flush_worker::FlushWorker;
pub use memory_storage::MemoryStorage;
pub use sqlite_storage::SqliteStorage;
pub use tiered::TieredStorage;
pub use types::{
    BatchOutcome, HttpHeaders, Lease, RecordFilter, StorageRecord, StorageRecordId, StorageStats,
    StorageTier, TenantCounts,
};

use crate::types::EventLatency;
use std::time::Duration;

/// Callback fed each leased record; returning `false` stops leasing.
pub type RecordConsumer<'a> = dyn FnMut(StorageRecord) -> bool + 'a;

/// Contract shared by the memory and disk tiers.
///
/// All methods take `&self`; implementations synchronize internally and are
/// safe to call from any thread.
pub trait OfflineStorage: Send + Sync {
    /// Which tier this is.
    fn tier(&self) -> StorageTier;

    /// Store one record. Returns whether the tier accepted it.
    fn store_record(&self, record: StorageRecord) -> bool;

    /// Store a batch, reporting each record's outcome.
    fn store_records(&self, records: Vec<StorageRecord>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in records {
            if self.store_record(record.clone()) {
                outcome.stored += 1;
            } else {
                outcome.failed.push(record);
            }
        }
        outcome
    }

    /// Lease up to `max_count` available records at or above `min_latency`
    /// (0 means no limit), feeding each one to `consumer` in tier order.
    ///
    /// Returns `false` only when the tier could not be read.
    fn get_and_reserve_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool;

    /// Number of records handed out by the last lease call.
    fn last_read_record_count(&self) -> usize;

    /// Permanently remove delivered records.
    fn delete_records(&self, ids: &[StorageRecordId], headers: &HttpHeaders) -> bool;

    /// Clear the lease on records, optionally bumping their retry count.
    fn release_records(
        &self,
        ids: &[StorageRecordId],
        increment_retry_count: bool,
        headers: &HttpHeaders,
    ) -> bool;

    /// Sum of payload bytes of every resident record, leased or not.
    fn get_size(&self) -> usize;

    /// Resident records of the given latency, or of all latencies.
    fn get_record_count(&self, latency: Option<EventLatency>) -> usize;

    /// Evict content until the tier is within its bound.
    fn resize_db(&self) -> bool;

    fn store_setting(&self, _name: &str, _value: &str) -> bool {
        false
    }

    fn get_setting(&self, _name: &str) -> Option<String> {
        None
    }

    fn delete_setting(&self, _name: &str) -> bool {
        false
    }

    fn shutdown(&self);
}

/// Notifications emitted by the tiers and the orchestrator.
///
/// Fire-and-forget: implementations must not block. Flush notifications
/// run while the flush lock is held, so they must not flush or wait for a
/// flush themselves.
pub trait OfflineStorageObserver: Send + Sync {
    fn on_storage_opened(&self, _kind: &str) {}

    fn on_storage_failed(&self, _reason: &str) {}

    /// Records evicted to bring a tier back under its bound.
    fn on_storage_trimmed(&self, _counts: &TenantCounts) {}

    /// Records lost without having been delivered.
    fn on_records_dropped(&self, _counts: &TenantCounts) {}

    /// Records refused as malformed or oversized.
    fn on_records_rejected(&self, _counts: &TenantCounts) {}

    /// Records persisted to disk by a flush.
    fn on_records_saved(&self, _count: usize) {}

    /// Memory tier crossed its nearly-full threshold.
    fn on_storage_full(&self, _used_bytes: usize, _limit_bytes: usize) {}

    /// Memory tier refilled past its pre-flush size while flushing.
    fn on_backpressure(&self, _size_before: usize, _size_after: usize) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl OfflineStorageObserver for NoopObserver {}
