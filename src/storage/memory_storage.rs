//! Memory tier - bounded in-process record queue.
//!
//! Records live in insertion order behind a single mutex that also guards
//! the byte count, so a store racing a flush drain can never leave the size
//! out of step with the resident records.

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::types::{
    count_by_tenant, HttpHeaders, Lease, RecordFilter, StorageRecord, StorageRecordId, StorageTier,
    TenantCounts,
};
use super::{OfflineStorage, OfflineStorageObserver, RecordConsumer};
use crate::error::StorageError;
use crate::types::{now_ms, EventLatency};

/// Records keyed by insertion sequence, plus an id index.
#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<u64, StorageRecord>,
    index: HashMap<StorageRecordId, u64>,
    size: usize,
    next_seq: u64,
    /// No new leases are granted
    lease_closed: bool,
    /// Stores are refused with [`StorageError::Closed`]
    closed: bool,
}

impl MemoryInner {
    fn insert(&mut self, mut record: StorageRecord) -> usize {
        if let Some(seq) = self.index.remove(&record.id) {
            if let Some(old) = self.records.remove(&seq) {
                self.size -= old.size();
            }
        }

        record.tier = Some(StorageTier::Memory);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.size += record.size();
        self.index.insert(record.id.clone(), seq);
        self.records.insert(seq, record);
        self.size
    }

    fn remove(&mut self, id: &str) -> Option<StorageRecord> {
        let seq = self.index.remove(id)?;
        let record = self.records.remove(&seq)?;
        self.size -= record.size();
        Some(record)
    }
}

/// A record the memory tier did not take, handed back to the caller.
#[derive(Debug)]
pub struct Refused {
    pub record: StorageRecord,
    pub error: StorageError,
}

/// Volatile tier; the orchestrator's primary write target.
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
    observer: Arc<dyn OfflineStorageObserver>,
    /// Quota in bytes, enforced by `resize_db`
    size_limit: usize,
    last_read_count: AtomicUsize,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStorage")
            .field("records", &inner.records.len())
            .field("size", &inner.size)
            .field("size_limit", &self.size_limit)
            .finish()
    }
}

impl MemoryStorage {
    /// Create an empty memory tier with the given byte quota.
    pub fn new(size_limit: usize, observer: Arc<dyn OfflineStorageObserver>) -> Self {
        info!("Opened memory storage with {} byte quota", size_limit);
        observer.on_storage_opened("Memory");

        Self {
            inner: Mutex::new(MemoryInner::default()),
            observer,
            size_limit,
            last_read_count: AtomicUsize::new(0),
        }
    }

    /// Insert a record and return the tier size right after the insert.
    ///
    /// A record with an id already present replaces the old one. A refused
    /// record is returned untouched inside [`Refused`].
    pub fn store(&self, record: StorageRecord) -> std::result::Result<usize, Refused> {
        if record.id.is_empty() || record.tenant_token.is_empty() {
            let error = StorageError::Rejected {
                id: record.id.clone(),
                reason: "missing record id or tenant token".to_string(),
            };
            return Err(Refused { record, error });
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Refused {
                record,
                error: StorageError::Closed,
            });
        }
        Ok(inner.insert(record))
    }

    /// Quota in bytes.
    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Lease available records and feed them to `consumer`.
    ///
    /// Candidates are reserved under the lock, then handed out without it so
    /// the consumer may call back into storage. Records not consumed because
    /// the consumer stopped early get their lease back.
    pub fn lease_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> usize {
        let now = now_ms();
        let token = Uuid::new_v4().to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
        let reserved_until = now.saturating_add(lease_ms);
        let limit = if max_count == 0 { usize::MAX } else { max_count };

        let batch: Vec<StorageRecord> = {
            let mut inner = self.inner.lock();
            if inner.lease_closed || inner.closed {
                return 0;
            }
            inner
                .records
                .values_mut()
                .filter(|r| r.latency >= min_latency && r.is_available(now))
                .take(limit)
                .map(|r| {
                    r.lease = Some(Lease::new(token.clone(), reserved_until));
                    r.clone()
                })
                .collect()
        };

        let mut consumed = 0;
        let mut pending = batch.into_iter();
        for record in pending.by_ref() {
            consumed += 1;
            if !consumer(record) {
                break;
            }
        }

        let unused: Vec<StorageRecordId> = pending.map(|r| r.id).collect();
        if !unused.is_empty() {
            let mut inner = self.inner.lock();
            for id in &unused {
                if let Some(seq) = inner.index.get(id).copied() {
                    if let Some(record) = inner.records.get_mut(&seq) {
                        if record.lease.as_ref().map_or(false, |l| l.token == token) {
                            record.lease = None;
                        }
                    }
                }
            }
        }

        trace!("Memory storage leased {} record(s)", consumed);
        consumed
    }

    /// Remove and return every unleased record at or above `min_latency`,
    /// oldest first. Used only by the flush.
    pub fn take_records(&self, min_latency: EventLatency) -> Vec<StorageRecord> {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let seqs: Vec<u64> = inner
            .records
            .iter()
            .filter(|(_, r)| r.latency >= min_latency && r.is_available(now))
            .map(|(seq, _)| *seq)
            .collect();

        let mut taken = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(mut record) = inner.records.remove(&seq) {
                inner.index.remove(&record.id);
                inner.size -= record.size();
                record.lease = None;
                record.tier = None;
                taken.push(record);
            }
        }
        taken
    }

    /// Remove every record matching `filter`, leased or not. An empty
    /// filter removes nothing.
    pub fn delete_records_where(&self, filter: &RecordFilter) -> usize {
        if filter.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let ids: Vec<StorageRecordId> = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            inner.remove(id);
        }
        if !ids.is_empty() {
            debug!("Memory storage deleted {} filtered record(s)", ids.len());
        }
        ids.len()
    }

    /// Log a refused store; rejections also reach the observer.
    pub fn report_refused(&self, refused: &Refused) {
        match &refused.error {
            StorageError::Rejected { id, reason } => {
                warn!("Memory storage rejected record {:?}: {}", id, reason);
                let mut counts = TenantCounts::new();
                counts.insert(refused.record.tenant_token.clone(), 1);
                self.observer.on_records_rejected(&counts);
            }
            error => debug!("Memory storage refused record {}: {}", refused.record.id, error),
        }
    }

    /// Clear every lease and refuse new leases and stores. Called before the
    /// final flush so nothing lands behind it.
    pub fn release_all_records(&self) {
        let mut inner = self.inner.lock();
        inner.lease_closed = true;
        inner.closed = true;
        for record in inner.records.values_mut() {
            record.lease = None;
        }
    }
}

impl OfflineStorage for MemoryStorage {
    fn tier(&self) -> StorageTier {
        StorageTier::Memory
    }

    fn store_record(&self, record: StorageRecord) -> bool {
        match self.store(record) {
            Ok(_) => true,
            Err(refused) => {
                self.report_refused(&refused);
                false
            }
        }
    }

    fn get_and_reserve_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        let count = self.lease_records(consumer, lease, min_latency, max_count);
        self.last_read_count.store(count, Ordering::Relaxed);
        true
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::Relaxed)
    }

    fn delete_records(&self, ids: &[StorageRecordId], _headers: &HttpHeaders) -> bool {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.remove(id);
        }
        true
    }

    fn release_records(
        &self,
        ids: &[StorageRecordId],
        increment_retry_count: bool,
        _headers: &HttpHeaders,
    ) -> bool {
        let mut inner = self.inner.lock();
        for id in ids {
            let Some(seq) = inner.index.get(id).copied() else {
                continue;
            };
            if let Some(record) = inner.records.get_mut(&seq) {
                record.lease = None;
                if increment_retry_count {
                    record.retry_count += 1;
                }
            }
        }
        true
    }

    fn get_size(&self) -> usize {
        self.inner.lock().size
    }

    fn get_record_count(&self, latency: Option<EventLatency>) -> usize {
        let inner = self.inner.lock();
        match latency {
            None => inner.records.len(),
            Some(latency) => inner.records.values().filter(|r| r.latency == latency).count(),
        }
    }

    /// Evict unleased records first, then leased ones, lowest latency and
    /// oldest first, until the tier fits its quota.
    fn resize_db(&self) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.size <= self.size_limit {
                return true;
            }

            let now = now_ms();
            let mut order: Vec<(bool, EventLatency, u64)> = inner
                .records
                .iter()
                .map(|(seq, r)| (!r.is_available(now), r.latency, *seq))
                .collect();
            order.sort_unstable();

            let mut evicted = Vec::new();
            for (_, _, seq) in order {
                if inner.size <= self.size_limit {
                    break;
                }
                if let Some(record) = inner.records.remove(&seq) {
                    inner.index.remove(&record.id);
                    inner.size -= record.size();
                    evicted.push(record);
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            warn!("Memory storage evicted {} record(s) over quota", evicted.len());
            self.observer.on_records_dropped(&count_by_tenant(&evicted));
        }
        true
    }

    /// Discard anything still resident. The orchestrator flushes first.
    fn shutdown(&self) {
        let leftover: Vec<StorageRecord> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.lease_closed = true;
            inner.index.clear();
            inner.size = 0;
            std::mem::take(&mut inner.records).into_values().collect()
        };

        if !leftover.is_empty() {
            warn!(
                "Memory storage shut down with {} unflushed record(s)",
                leftover.len()
            );
            self.observer.on_records_dropped(&count_by_tenant(&leftover));
        }
        info!("Memory storage shut down");
    }
}
