//! # Storage Observer
//!
//! Thread-safe adapter between the upload pipeline's lifecycle and the
//! tiered store. The pipeline never touches a tier directly: it hands
//! contexts to this observer, which stores, leases, deletes and releases
//! through [`TieredStorage`] and relays storage notifications back.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::context::{
    DebugEvent, DebugEventType, EventsUploadContext, IncomingEventContext, StorageNotification,
    UploadPipeline, UploadRecordRef,
};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::storage::{
    HttpHeaders, OfflineStorageObserver, StorageRecordId, StorageTier, TenantCounts, TieredStorage,
};
use crate::types::now_ms;

/// Forwards tier notifications to the pipeline on both channels.
struct NotificationRelay {
    pipeline: Arc<dyn UploadPipeline>,
}

impl NotificationRelay {
    fn notify(&self, notification: StorageNotification) {
        self.pipeline.on_storage_notification(&notification);
        self.pipeline.dispatch_debug_event(&notification.debug_event());
    }
}

impl OfflineStorageObserver for NotificationRelay {
    fn on_storage_opened(&self, kind: &str) {
        self.notify(StorageNotification::Opened {
            kind: kind.to_string(),
        });
    }

    fn on_storage_failed(&self, reason: &str) {
        self.notify(StorageNotification::Failed {
            reason: reason.to_string(),
        });
    }

    fn on_storage_trimmed(&self, counts: &TenantCounts) {
        self.notify(StorageNotification::Trimmed {
            counts: counts.clone(),
        });
    }

    fn on_records_dropped(&self, counts: &TenantCounts) {
        self.notify(StorageNotification::RecordsDropped {
            counts: counts.clone(),
        });
    }

    fn on_records_rejected(&self, counts: &TenantCounts) {
        self.notify(StorageNotification::RecordsRejected {
            counts: counts.clone(),
        });
    }

    fn on_records_saved(&self, count: usize) {
        self.notify(StorageNotification::RecordsSaved { count });
    }

    fn on_storage_full(&self, used_bytes: usize, limit_bytes: usize) {
        self.notify(StorageNotification::StorageFull {
            used_bytes,
            limit_bytes,
        });
    }

    fn on_backpressure(&self, size_before: usize, size_after: usize) {
        self.notify(StorageNotification::Backpressure {
            size_before,
            size_after,
        });
    }
}

/// Counters kept by the observer for its own handlers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub stored: u64,
    pub store_failures: u64,
    pub retrievals: u64,
    pub acknowledged: u64,
    pub retried: u64,
    pub rejected_final: u64,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    store_failures: AtomicU64,
    retrievals: AtomicU64,
    acknowledged: AtomicU64,
    retried: AtomicU64,
    rejected_final: AtomicU64,
}

/// Pipeline adapter owning the tiered store between `on_start` and `on_stop`.
pub struct StorageObserver {
    /// Configuration handed to the store on start
    config: StorageConfig,

    pipeline: Arc<dyn UploadPipeline>,

    /// Notification sink installed into the store
    relay: Arc<NotificationRelay>,

    /// Open store; `None` before start and after stop
    storage: RwLock<Option<Arc<TieredStorage>>>,

    counters: Counters,
}

impl StorageObserver {
    pub fn new(config: StorageConfig, pipeline: Arc<dyn UploadPipeline>) -> Self {
        let relay = Arc::new(NotificationRelay {
            pipeline: Arc::clone(&pipeline),
        });
        Self {
            config,
            pipeline,
            relay,
            storage: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Open the tiered store. Calling it again while started is a no-op.
    pub fn on_start(&self) -> Result<()> {
        let mut storage = self.storage.write();
        if storage.is_some() {
            debug!("Storage observer already started");
            return Ok(());
        }

        let relay: Arc<dyn OfflineStorageObserver> = self.relay.clone();
        let opened = TieredStorage::open(self.config.clone(), relay)?;
        *storage = Some(Arc::new(opened));
        info!("Storage observer started");
        Ok(())
    }

    /// Shut the store down, flushing memory to disk.
    pub fn on_stop(&self) -> bool {
        let Some(storage) = self.storage.write().take() else {
            return false;
        };
        storage.shutdown();
        info!("Storage observer stopped");
        true
    }

    /// The open store, if started.
    pub fn storage(&self) -> Option<Arc<TieredStorage>> {
        self.storage.read().clone()
    }

    pub fn stats(&self) -> ObserverStats {
        let c = &self.counters;
        ObserverStats {
            stored: c.stored.load(Ordering::Relaxed),
            store_failures: c.store_failures.load(Ordering::Relaxed),
            retrievals: c.retrievals.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            rejected_final: c.rejected_final.load(Ordering::Relaxed),
        }
    }

    /// Timestamp and store a producer's record.
    pub fn on_incoming_record(&self, ctx: &mut IncomingEventContext) -> bool {
        ctx.record.timestamp = now_ms();

        let stored = match self.storage() {
            Some(storage) => storage.store_record(ctx.record.clone()),
            None => {
                warn!("Record {} arrived before storage started", ctx.record.id);
                false
            }
        };

        if !stored {
            self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
            self.pipeline.store_record_failed(ctx);
            return false;
        }

        self.counters.stored.fetch_add(1, Ordering::Relaxed);
        self.dispatch(DebugEventType::Cached, 1, ctx.record.size() as u64);
        true
    }

    /// Lease a batch for upload into `ctx`.
    pub fn on_retrieve_for_upload(&self, ctx: &mut EventsUploadContext) {
        let Some(storage) = self.storage() else {
            self.pipeline.retrieval_failed(ctx);
            return;
        };
        self.counters.retrievals.fetch_add(1, Ordering::Relaxed);

        let pipeline = &self.pipeline;
        let min_latency = ctx.requested_min_latency;
        let max_count = ctx.requested_max_count;
        let ok = storage.get_and_reserve_records(
            &mut |record| {
                ctx.records.push(UploadRecordRef {
                    id: record.id.clone(),
                    tenant_token: record.tenant_token.clone(),
                    latency: record.latency,
                    tier: record.tier,
                });
                pipeline.record_retrieved(ctx, record)
            },
            self.config.upload_lease,
            min_latency,
            max_count,
        );

        ctx.from_memory = storage.is_last_read_from_memory();
        if ok {
            self.pipeline.retrieval_finished(ctx);
        } else {
            self.pipeline.retrieval_failed(ctx);
        }
    }

    /// The batch was delivered: delete it.
    pub fn on_upload_acknowledged(&self, ctx: &EventsUploadContext) -> bool {
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.route(ctx, |storage, ids, headers, from_memory| {
            storage.delete_records(ids, headers, from_memory)
        })
    }

    /// The collector asked for a retry: release with a retry bump.
    pub fn on_upload_rejected_retryable(&self, ctx: &EventsUploadContext) -> bool {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        self.dispatch(DebugEventType::SendRetry, ctx.records.len() as u64, 0);
        self.route(ctx, |storage, ids, headers, from_memory| {
            storage.release_records(ids, true, headers, from_memory)
        })
    }

    /// The batch will not be retried by the pipeline: release it as is.
    pub fn on_upload_rejected_final(&self, ctx: &EventsUploadContext) -> bool {
        self.counters.rejected_final.fetch_add(1, Ordering::Relaxed);
        self.route(ctx, |storage, ids, headers, from_memory| {
            storage.release_records(ids, false, headers, from_memory)
        })
    }

    /// Apply `op` to the batch's ids, split by the tier each record came
    /// from. Records without a known tier follow `ctx.from_memory`.
    fn route<F>(&self, ctx: &EventsUploadContext, op: F) -> bool
    where
        F: Fn(&TieredStorage, &[StorageRecordId], &HttpHeaders, bool) -> bool,
    {
        let Some(storage) = self.storage() else {
            return false;
        };
        let empty = HttpHeaders::new();
        let headers = ctx.response_headers.as_ref().unwrap_or(&empty);

        let (memory_refs, disk_refs): (Vec<&UploadRecordRef>, Vec<&UploadRecordRef>) =
            ctx.records.iter().partition(|r| match r.tier {
                Some(StorageTier::Memory) => true,
                Some(StorageTier::Disk) => false,
                None => ctx.from_memory,
            });

        let mut ok = true;
        for (refs, from_memory) in [(memory_refs, true), (disk_refs, false)] {
            if refs.is_empty() {
                continue;
            }
            let ids: Vec<StorageRecordId> = refs.into_iter().map(|r| r.id.clone()).collect();
            ok &= op(storage.as_ref(), &ids, headers, from_memory);
        }
        ok
    }

    fn dispatch(&self, kind: DebugEventType, param1: u64, size: u64) {
        self.pipeline
            .dispatch_debug_event(&DebugEvent::new(kind, param1, size));
    }
}

impl Drop for StorageObserver {
    fn drop(&mut self) {
        self.on_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageRecord;
    use crate::types::EventLatency;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPipeline {
        failed: Mutex<usize>,
        events: Mutex<Vec<DebugEvent>>,
    }

    impl UploadPipeline for RecordingPipeline {
        fn store_record_failed(&self, _ctx: &IncomingEventContext) {
            *self.failed.lock() += 1;
        }

        fn record_retrieved(&self, _ctx: &mut EventsUploadContext, _record: StorageRecord) -> bool {
            true
        }

        fn retrieval_finished(&self, _ctx: &EventsUploadContext) {}

        fn retrieval_failed(&self, _ctx: &EventsUploadContext) {}

        fn dispatch_debug_event(&self, event: &DebugEvent) {
            self.events.lock().push(*event);
        }
    }

    fn observer(dir: &tempfile::TempDir) -> (StorageObserver, Arc<RecordingPipeline>) {
        let pipeline = Arc::new(RecordingPipeline::default());
        let config = StorageConfig {
            db_path: dir.path().join("offline.db"),
            ..StorageConfig::default()
        };
        (StorageObserver::new(config, pipeline.clone()), pipeline)
    }

    #[test]
    fn test_store_before_start_fails_softly() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (observer, pipeline) = observer(&tmp_dir);

        let mut ctx = IncomingEventContext::new(StorageRecord::new(
            "tenant",
            EventLatency::Normal,
            vec![1, 2, 3],
        ));
        assert!(!observer.on_incoming_record(&mut ctx));
        assert_eq!(*pipeline.failed.lock(), 1);
        assert_eq!(observer.stats().store_failures, 1);
    }

    #[test]
    fn test_store_stamps_timestamp_and_dispatches_cached() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (observer, pipeline) = observer(&tmp_dir);
        observer.on_start().unwrap();

        let mut ctx = IncomingEventContext::new(StorageRecord::new(
            "tenant",
            EventLatency::Normal,
            vec![1, 2, 3],
        ));
        ctx.record.timestamp = 0;
        assert!(observer.on_incoming_record(&mut ctx));
        assert!(ctx.record.timestamp > 0);

        let events = pipeline.events.lock();
        assert!(events
            .iter()
            .any(|e| e.kind == DebugEventType::Cached && e.size == 3));
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (observer, _pipeline) = observer(&tmp_dir);
        observer.on_start().unwrap();

        assert!(observer.on_stop());
        assert!(!observer.on_stop());
        assert!(observer.storage().is_none());
    }
}
