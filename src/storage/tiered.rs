//! Tiered storage orchestrator.
//!
//! Composes the memory and disk tiers into one logical store:
//! - writes go to memory while it exists and shutdown has not started
//! - crossing the memory quota schedules a background flush into disk
//! - leases drain memory first, then disk with the remaining budget
//! - deletes and releases are routed to the tier the caller leased from
//!
//! # Flush coordination
//! One execution lock serializes flushes. A small state mutex tracks whether
//! a flush is pending and which scheduled job (if any) is still allowed to
//! run; an explicit [`TieredStorage::flush`] withdraws that permission, so a
//! job that has not started yet becomes a no-op. Waiters block on a condvar
//! until nothing is pending.

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::flush_worker::FlushWorker;
use super::memory_storage::{MemoryStorage, Refused};
use super::sqlite_storage::SqliteStorage;
use super::types::{
    count_by_tenant, HttpHeaders, RecordFilter, StorageRecord, StorageRecordId, StorageStats,
};
use super::{OfflineStorage, OfflineStorageObserver, RecordConsumer};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::types::EventLatency;

#[derive(Debug, Default)]
struct FlushState {
    /// A flush is scheduled or running
    pending: bool,
    /// Ticket of the scheduled job still allowed to run
    scheduled: Option<u64>,
    next_ticket: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct LastRead {
    count: usize,
    from_memory: bool,
}

struct Shared {
    config: StorageConfig,
    memory: Option<MemoryStorage>,
    disk: SqliteStorage,
    observer: Arc<dyn OfflineStorageObserver>,
    memory_notification_limit: usize,
    shutdown_started: AtomicBool,
    storage_full_notified: AtomicBool,
    flush_lock: Mutex<()>,
    flush_state: Mutex<FlushState>,
    flush_done: Condvar,
    last_read: Mutex<LastRead>,
    flushes: AtomicU64,
    records_flushed: AtomicU64,
}

/// Memory + disk offline store shared by producers and the upload pipeline.
pub struct TieredStorage {
    shared: Arc<Shared>,
    worker: FlushWorker,
}

impl std::fmt::Debug for TieredStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStorage")
            .field("memory", &self.shared.memory)
            .field("disk", &self.shared.disk)
            .field("worker", &self.worker)
            .finish()
    }
}

impl TieredStorage {
    /// Open the disk tier, and the memory tier when `ram_queue_bytes > 0`.
    ///
    /// Tier notifications go straight to `observer`. Fails if the disk tier
    /// cannot be opened; the store is unusable in that case.
    pub fn open(config: StorageConfig, observer: Arc<dyn OfflineStorageObserver>) -> Result<Self> {
        let disk = SqliteStorage::open(&config, Arc::clone(&observer))?;
        let memory = if config.ram_queue_bytes > 0 {
            Some(MemoryStorage::new(config.ram_queue_bytes, Arc::clone(&observer)))
        } else {
            info!("Memory tier disabled, writing straight to disk");
            None
        };
        let worker = FlushWorker::new()?;

        let shared = Shared {
            memory_notification_limit: config.memory_notification_limit(),
            config,
            memory,
            disk,
            observer,
            shutdown_started: AtomicBool::new(false),
            storage_full_notified: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            flush_state: Mutex::new(FlushState::default()),
            flush_done: Condvar::new(),
            last_read: Mutex::new(LastRead::default()),
            flushes: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
        };

        info!("Initialized tiered offline storage");
        Ok(Self {
            shared: Arc::new(shared),
            worker,
        })
    }

    /// The memory tier, if enabled.
    pub fn memory(&self) -> Option<&MemoryStorage> {
        self.shared.memory.as_ref()
    }

    /// The disk tier.
    pub fn disk(&self) -> &SqliteStorage {
        &self.shared.disk
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown_started.load(Ordering::SeqCst)
    }

    /// Store a record. Never waits on the flush it may schedule.
    ///
    /// Goes to memory unless the memory tier is disabled or shutdown has
    /// started, in which case it goes straight to disk.
    pub fn store_record(&self, record: StorageRecord) -> bool {
        let shared = &self.shared;

        let record = match shared.memory.as_ref() {
            Some(memory) if !shared.shutdown_started.load(Ordering::SeqCst) => {
                match memory.store(record) {
                    Ok(size) => {
                        self.after_memory_store(memory, size);
                        return true;
                    }
                    Err(Refused {
                        record,
                        error: StorageError::Closed,
                    }) => record,
                    Err(refused) => {
                        memory.report_refused(&refused);
                        return false;
                    }
                }
            }
            _ => record,
        };

        shared.disk.store_record(record)
    }

    fn after_memory_store(&self, memory: &MemoryStorage, size: usize) {
        let shared = &self.shared;

        if size > shared.memory_notification_limit
            && !shared.storage_full_notified.swap(true, Ordering::SeqCst)
        {
            info!(
                "Memory storage nearly full: {} of {} bytes",
                size,
                memory.size_limit()
            );
            shared
                .observer
                .on_storage_full(size, shared.memory_notification_limit);
        }

        if size > memory.size_limit() {
            self.schedule_flush();
        }
    }

    /// Queue a flush on the worker unless one is already pending.
    fn schedule_flush(&self) {
        let ticket = {
            let mut state = self.shared.flush_state.lock();
            if state.pending {
                return;
            }
            state.next_ticket += 1;
            state.pending = true;
            state.scheduled = Some(state.next_ticket);
            state.next_ticket
        };

        info!("Requested flush #{}", ticket);
        let job = ScheduledFlush {
            shared: Arc::downgrade(&self.shared),
            ticket,
        };
        self.worker.spawn(move || job.run());
    }

    /// Drain the memory tier into the disk tier now.
    ///
    /// Cancels a scheduled flush that has not started; waits behind one
    /// that is already running.
    pub fn flush(&self) {
        self.shared.flush(false);
    }

    /// Block until no flush is pending. Returns at once if none is.
    pub fn wait_for_flush(&self) {
        self.shared.wait_for_flush();
    }

    /// Lease up to `max_count` records (0 = no limit) at or above
    /// `min_latency`, memory first, then disk with what is left.
    ///
    /// Stops as soon as `consumer` returns `false`. Returns whether either
    /// tier could be read.
    pub fn get_and_reserve_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        let shared = &self.shared;
        let mut ok = false;
        let mut total = 0;
        let mut from_memory = false;
        let mut stopped = false;
        let mut remaining = max_count;

        if let Some(memory) = shared.memory.as_ref() {
            let count = memory.lease_records(
                &mut |record| {
                    let more = consumer(record);
                    stopped = !more;
                    more
                },
                lease,
                min_latency,
                max_count,
            );
            ok = true;
            total += count;
            from_memory = true;
            if max_count > 0 {
                remaining = max_count.saturating_sub(count);
            }
        }

        let budget_left = max_count == 0 || remaining > 0;
        if !stopped && budget_left {
            match shared.disk.lease_records(consumer, lease, min_latency, remaining) {
                Ok(count) => {
                    ok = true;
                    total += count;
                    if count > 0 {
                        from_memory = false;
                    }
                }
                Err(e) => warn!("Failed to lease records from disk: {}", e),
            }
        }

        *shared.last_read.lock() = LastRead {
            count: total,
            from_memory,
        };
        ok
    }

    /// Record count of the last lease call.
    pub fn last_read_record_count(&self) -> usize {
        self.shared.last_read.lock().count
    }

    /// Whether the last lease call's final non-empty source was memory.
    pub fn is_last_read_from_memory(&self) -> bool {
        self.shared.last_read.lock().from_memory
    }

    /// The tier a delete or release for `from_memory` records goes to.
    fn route(&self, from_memory: bool) -> &dyn OfflineStorage {
        match self.shared.memory.as_ref() {
            Some(memory) if from_memory => memory as &dyn OfflineStorage,
            _ => &self.shared.disk,
        }
    }

    /// Remove delivered records from the tier they were leased from.
    /// No-op once shutdown has started.
    pub fn delete_records(
        &self,
        ids: &[StorageRecordId],
        headers: &HttpHeaders,
        from_memory: bool,
    ) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let tier = self.route(from_memory);
        if let Some(first) = ids.first() {
            trace!(
                "Deleting {} sent event(s) {{{}{}}} from {:?}",
                ids.len(),
                first,
                if ids.len() > 1 { ", ..." } else { "" },
                tier.tier()
            );
        }
        tier.delete_records(ids, headers)
    }

    /// Return leased records to the pool, optionally counting a retry.
    /// No-op once shutdown has started.
    pub fn release_records(
        &self,
        ids: &[StorageRecordId],
        increment_retry_count: bool,
        headers: &HttpHeaders,
        from_memory: bool,
    ) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let tier = self.route(from_memory);
        trace!("Releasing {} event(s) to {:?}", ids.len(), tier.tier());
        tier.release_records(ids, increment_retry_count, headers)
    }

    /// Delete records matching `filter` from both tiers, leased or not.
    /// An empty filter deletes nothing. Memory is left alone if disk fails.
    pub fn delete_records_where(&self, filter: &RecordFilter) -> Result<usize> {
        let from_disk = self.shared.disk.delete_records_where(filter)?;
        let from_memory = self
            .shared
            .memory
            .as_ref()
            .map_or(0, |memory| memory.delete_records_where(filter));
        Ok(from_disk + from_memory)
    }

    pub fn store_setting(&self, name: &str, value: &str) -> bool {
        self.shared.disk.store_setting(name, value)
    }

    pub fn get_setting(&self, name: &str) -> Option<String> {
        self.shared.disk.get_setting(name)
    }

    pub fn delete_setting(&self, name: &str) -> bool {
        self.shared.disk.delete_setting(name)
    }

    /// Ask both tiers to enforce their bounds.
    pub fn resize_db(&self) -> bool {
        let memory_ok = self
            .shared
            .memory
            .as_ref()
            .map_or(true, |memory| memory.resize_db());
        self.shared.disk.resize_db() && memory_ok
    }

    /// Payload bytes across both tiers.
    pub fn get_size(&self) -> usize {
        self.shared.memory.as_ref().map_or(0, |m| m.get_size()) + self.shared.disk.get_size()
    }

    /// Records across both tiers, optionally of one latency.
    pub fn get_record_count(&self, latency: Option<EventLatency>) -> usize {
        self.shared
            .memory
            .as_ref()
            .map_or(0, |m| m.get_record_count(latency))
            + self.shared.disk.get_record_count(latency)
    }

    pub fn stats(&self) -> StorageStats {
        let shared = &self.shared;
        let last_read = *shared.last_read.lock();
        StorageStats {
            memory_records: shared.memory.as_ref().map_or(0, |m| m.get_record_count(None)),
            memory_bytes: shared.memory.as_ref().map_or(0, |m| m.get_size()),
            disk_records: shared.disk.get_record_count(None),
            disk_bytes: shared.disk.get_size(),
            flushes: shared.flushes.load(Ordering::Relaxed),
            records_flushed: shared.records_flushed.load(Ordering::Relaxed),
            last_read_count: last_read.count,
            last_read_from_memory: last_read.from_memory,
        }
    }

    /// Stop accepting memory writes, flush memory to disk and close both
    /// tiers. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down tiered offline storage");
        shared.wait_for_flush();

        if let Some(memory) = shared.memory.as_ref() {
            memory.release_all_records();
            shared.flush(true);
            memory.shutdown();
        }
        shared.disk.shutdown();
    }
}

impl Drop for TieredStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A queued flush job. Dropping it, run or not, settles its ticket.
struct ScheduledFlush {
    shared: Weak<Shared>,
    ticket: u64,
}

impl ScheduledFlush {
    fn run(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.run_scheduled_flush(self.ticket);
        }
    }
}

impl Drop for ScheduledFlush {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.settle_ticket(self.ticket);
        }
    }
}

impl Shared {
    /// Caller's [`ScheduledFlush`] settles the ticket afterwards.
    fn run_scheduled_flush(&self, ticket: u64) {
        let _guard = self.flush_lock.lock();
        {
            let mut state = self.flush_state.lock();
            if state.scheduled != Some(ticket) {
                debug!("Flush #{} was superseded", ticket);
                return;
            }
            state.scheduled = None;
        }
        self.flush_locked(false);
    }

    /// Withdraw `ticket` if it never started, then recompute `pending`.
    fn settle_ticket(&self, ticket: u64) {
        let mut state = self.flush_state.lock();
        if state.scheduled == Some(ticket) {
            warn!("Flush #{} never ran", ticket);
            state.scheduled = None;
        }
        state.pending = state.scheduled.is_some();
        self.flush_done.notify_all();
    }

    fn flush(&self, is_final: bool) {
        let _guard = self.flush_lock.lock();
        self.flush_state.lock().scheduled = None;
        self.flush_locked(is_final);
        self.finish_flush();
    }

    /// Body of a flush; caller holds `flush_lock`.
    fn flush_locked(&self, is_final: bool) {
        if let Some(memory) = self.memory.as_ref() {
            let size_before = memory.get_size();
            if size_before > 0 {
                let records = memory.take_records(EventLatency::Off);
                if !records.is_empty() {
                    let drained = records.len();
                    let outcome = self.disk.store_records(records);

                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    self.records_flushed
                        .fetch_add(outcome.stored as u64, Ordering::Relaxed);
                    debug!("Flushed {} of {} record(s) to disk", outcome.stored, drained);
                    self.observer.on_records_saved(outcome.stored);

                    let size_after = memory.get_size();
                    if size_after > size_before {
                        warn!("Data is arriving too fast!");
                        self.observer.on_backpressure(size_before, size_after);
                    }

                    self.requeue_failed(memory, outcome.failed, is_final);
                }
            }
        }

        self.storage_full_notified.store(false, Ordering::SeqCst);
    }

    /// Put records the disk failed to persist back into memory. Records out
    /// of flush retries, or failing the final flush, are dropped.
    fn requeue_failed(&self, memory: &MemoryStorage, failed: Vec<StorageRecord>, is_final: bool) {
        if failed.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        let mut retry = Vec::new();
        for mut record in failed {
            record.flush_failures += 1;
            if is_final || record.flush_failures >= self.config.max_flush_retries {
                dropped.push(record);
            } else {
                retry.push(record);
            }
        }

        let outcome = memory.store_records(retry);
        let requeued = outcome.stored;
        dropped.extend(outcome.failed);

        if requeued > 0 {
            warn!("Requeued {} record(s) the disk failed to persist", requeued);
        }
        if !dropped.is_empty() {
            warn!("Dropped {} record(s) the disk failed to persist", dropped.len());
            self.observer.on_records_dropped(&count_by_tenant(&dropped));
        }
    }

    fn finish_flush(&self) {
        let mut state = self.flush_state.lock();
        state.pending = state.scheduled.is_some();
        self.flush_done.notify_all();
    }

    fn wait_for_flush(&self) {
        let mut state = self.flush_state.lock();
        if !state.pending {
            return;
        }
        info!("Waiting for pending flush to complete...");
        while state.pending {
            self.flush_done.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NoopObserver;

    fn open(dir: &tempfile::TempDir, ram_queue_bytes: usize) -> TieredStorage {
        let config = StorageConfig {
            db_path: dir.path().join("offline.db"),
            ram_queue_bytes,
            ..StorageConfig::default()
        };
        TieredStorage::open(config, Arc::new(NoopObserver)).unwrap()
    }

    fn record(size: usize) -> StorageRecord {
        StorageRecord::new("tenant", EventLatency::Normal, vec![1u8; size])
    }

    #[test]
    fn test_writes_go_to_memory_first() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 1000);

        assert!(storage.store_record(record(10)));
        assert_eq!(storage.memory().unwrap().get_size(), 10);
        assert_eq!(storage.disk().get_size(), 0);
        assert_eq!(storage.get_size(), 10);
    }

    #[test]
    fn test_zero_quota_disables_memory_tier() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 0);

        assert!(storage.memory().is_none());
        assert!(storage.store_record(record(10)));
        assert_eq!(storage.disk().get_size(), 10);
    }

    #[test]
    fn test_flush_moves_everything_unleased() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 1000);
        for _ in 0..5 {
            storage.store_record(record(10));
        }

        storage.flush();
        assert_eq!(storage.memory().unwrap().get_size(), 0);
        assert_eq!(storage.disk().get_size(), 50);
        assert_eq!(storage.stats().records_flushed, 5);
    }

    #[test]
    fn test_wait_for_flush_without_pending_returns() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 1000);
        storage.wait_for_flush();
    }

    #[test]
    fn test_settings_live_on_disk() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 1000);

        assert!(storage.store_setting("last_offset", "17"));
        assert_eq!(storage.get_setting("last_offset").as_deref(), Some("17"));
        assert!(storage.memory().unwrap().get_setting("last_offset").is_none());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = open(&tmp_dir, 1000);
        storage.store_record(record(10));

        storage.shutdown();
        storage.shutdown();
        assert!(storage.is_shutting_down());
        assert!(!storage.delete_records(&["x".to_string()], &HttpHeaders::new(), true));
    }
}
