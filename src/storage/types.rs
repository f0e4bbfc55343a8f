//! Storage data structures.
//!
//! Defines the record and bookkeeping types shared by the memory tier, the
//! disk tier and the orchestrator.

use crate::types::{now_ms, EventLatency};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Identifier of a stored record; unique within the tier that holds it.
pub type StorageRecordId = String;

/// Per-tenant record counts carried by trim/drop/reject notifications.
pub type TenantCounts = BTreeMap<String, usize>;

/// Response headers forwarded from the upload pipeline.
pub type HttpHeaders = HashMap<String, String>;

/// Which tier currently owns a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageTier {
    /// Volatile, bounded, fast
    Memory,
    /// SQLite database, survives restarts
    Disk,
}

/// Reservation of a record by an upload consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Shared by every record granted in one lease call
    pub token: String,
    /// Unix timestamp (ms) after which the record is leasable again
    pub reserved_until: u64,
}

impl Lease {
    pub fn new(token: String, reserved_until: u64) -> Self {
        Self {
            token,
            reserved_until,
        }
    }

    /// Whether the lease still blocks other consumers at `now`.
    #[inline]
    pub fn is_active(&self, now: u64) -> bool {
        self.reserved_until > now
    }
}

/// A single buffered telemetry event.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageRecord {
    pub id: StorageRecordId,
    pub tenant_token: String,
    pub latency: EventLatency,
    /// Ingestion time (Unix timestamp ms)
    pub timestamp: u64,
    /// Upload retries, owned by the pipeline
    pub retry_count: u32,
    /// Failed attempts to flush into disk; not persisted
    pub flush_failures: u32,
    /// Opaque serialized event
    pub blob: Vec<u8>,
    /// Set while a consumer holds the record
    pub lease: Option<Lease>,
    /// Tier that yielded or currently holds the record
    pub tier: Option<StorageTier>,
}

impl StorageRecord {
    /// Create a record with a fresh id, stamped with the current time.
    pub fn new(tenant_token: impl Into<String>, latency: EventLatency, blob: Vec<u8>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tenant_token, latency, blob)
    }

    pub fn with_id(
        id: impl Into<String>,
        tenant_token: impl Into<String>,
        latency: EventLatency,
        blob: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_token: tenant_token.into(),
            latency,
            timestamp: now_ms(),
            retry_count: 0,
            flush_failures: 0,
            blob,
            lease: None,
            tier: None,
        }
    }

    /// Bytes this record contributes to its tier's size.
    #[inline]
    pub fn size(&self) -> usize {
        self.blob.len()
    }

    /// Leasable at `now`: no lease, or the lease has expired.
    #[inline]
    pub fn is_available(&self, now: u64) -> bool {
        self.lease.as_ref().map_or(true, |lease| !lease.is_active(now))
    }
}

/// Per-record result of a batch store.
#[derive(Clone, Debug, Default)]
pub struct BatchOutcome {
    /// Number of records persisted
    pub stored: usize,
    /// Records refused by validation; a "rejected" notification was sent
    pub rejected: Vec<StorageRecord>,
    /// Records that hit a storage error and may be retried
    pub failed: Vec<StorageRecord>,
}

/// Filter for bulk deletes. Empty filter matches nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub tenant_token: Option<String>,
    pub latency: Option<EventLatency>,
}

impl RecordFilter {
    pub fn tenant(tenant_token: impl Into<String>) -> Self {
        Self {
            tenant_token: Some(tenant_token.into()),
            latency: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tenant_token.is_none() && self.latency.is_none()
    }

    pub fn matches(&self, record: &StorageRecord) -> bool {
        if self.is_empty() {
            return false;
        }
        self.tenant_token
            .as_ref()
            .map_or(true, |tenant| *tenant == record.tenant_token)
            && self.latency.map_or(true, |latency| latency == record.latency)
    }
}

/// Statistics about storage tier usage.
#[derive(Clone, Debug, Default)]
pub struct StorageStats {
    /// Records in the memory tier
    pub memory_records: usize,
    /// Bytes in the memory tier
    pub memory_bytes: usize,
    /// Records in the disk tier
    pub disk_records: usize,
    /// Bytes in the disk tier
    pub disk_bytes: usize,
    /// Completed flush passes that moved at least one record
    pub flushes: u64,
    /// Records persisted by flushes
    pub records_flushed: u64,
    /// Record count of the last lease call
    pub last_read_count: usize,
    /// Source of the last non-empty lease call
    pub last_read_from_memory: bool,
}

/// Counts records per tenant.
pub(crate) fn count_by_tenant<'a, I>(records: I) -> TenantCounts
where
    I: IntoIterator<Item = &'a StorageRecord>,
{
    let mut counts = TenantCounts::new();
    for record in records {
        *counts.entry(record.tenant_token.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_has_unique_id() {
        let a = StorageRecord::new("tenant", EventLatency::Normal, vec![1, 2, 3]);
        let b = StorageRecord::new("tenant", EventLatency::Normal, vec![1, 2, 3]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.size(), 3);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn test_lease_availability() {
        let mut record = StorageRecord::with_id("r1", "t", EventLatency::Normal, vec![0]);
        assert!(record.is_available(1000));

        record.lease = Some(Lease::new("tok".into(), 2000));
        assert!(!record.is_available(1000));
        assert!(!record.is_available(1999));
        assert!(record.is_available(2000));
    }

    #[test]
    fn test_record_filter() {
        let record = StorageRecord::with_id("r1", "acme", EventLatency::RealTime, vec![]);

        assert!(!RecordFilter::default().matches(&record));
        assert!(RecordFilter::tenant("acme").matches(&record));
        assert!(!RecordFilter::tenant("other").matches(&record));

        let filter = RecordFilter {
            tenant_token: Some("acme".into()),
            latency: Some(EventLatency::Normal),
        };
        assert!(!filter.matches(&record));
    }

    #[test]
    fn test_count_by_tenant() {
        let records = vec![
            StorageRecord::new("a", EventLatency::Normal, vec![]),
            StorageRecord::new("b", EventLatency::Normal, vec![]),
            StorageRecord::new("a", EventLatency::Normal, vec![]),
        ];
        let counts = count_by_tenant(&records);
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }
}
