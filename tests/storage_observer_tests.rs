//! Integration tests for the upload pipeline adapter.
//!
//! Tests verify:
//! - Start/stop lifecycle and soft failure outside it
//! - Retrieval into an upload context and tier routing of outcomes
//! - Notification relay on the structured and diagnostic channels

use offline_storage::storage::{OfflineStorage, StorageRecord, StorageTier};
use offline_storage::telemetry::{
    DebugEvent, DebugEventType, EventsUploadContext, IncomingEventContext, StorageNotification,
    StorageObserver, UploadPipeline,
};
use offline_storage::{EventLatency, StorageConfig};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct MockPipeline {
    /// Stop retrieval after this many records (0 = never)
    stop_after: usize,
    store_failures: Mutex<usize>,
    retrieved: Mutex<Vec<StorageRecord>>,
    finished: Mutex<usize>,
    failed: Mutex<usize>,
    notifications: Mutex<Vec<StorageNotification>>,
    events: Mutex<Vec<DebugEvent>>,
}

impl MockPipeline {
    fn events_of(&self, kind: DebugEventType) -> Vec<DebugEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .copied()
            .collect()
    }
}

impl UploadPipeline for MockPipeline {
    fn store_record_failed(&self, _ctx: &IncomingEventContext) {
        *self.store_failures.lock() += 1;
    }

    fn record_retrieved(&self, ctx: &mut EventsUploadContext, record: StorageRecord) -> bool {
        self.retrieved.lock().push(record);
        self.stop_after == 0 || ctx.records.len() < self.stop_after
    }

    fn retrieval_finished(&self, _ctx: &EventsUploadContext) {
        *self.finished.lock() += 1;
    }

    fn retrieval_failed(&self, _ctx: &EventsUploadContext) {
        *self.failed.lock() += 1;
    }

    fn on_storage_notification(&self, notification: &StorageNotification) {
        self.notifications.lock().push(notification.clone());
    }

    fn dispatch_debug_event(&self, event: &DebugEvent) {
        self.events.lock().push(*event);
    }
}

fn config(dir: &tempfile::TempDir) -> StorageConfig {
    StorageConfig {
        db_path: dir.path().join("offline.db"),
        ram_queue_bytes: 10_000,
        ..StorageConfig::default()
    }
}

fn started(config: StorageConfig, pipeline: MockPipeline) -> (StorageObserver, Arc<MockPipeline>) {
    let pipeline = Arc::new(pipeline);
    let observer = StorageObserver::new(config, pipeline.clone());
    observer.on_start().unwrap();
    (observer, pipeline)
}

fn incoming(tenant: &str, size: usize) -> IncomingEventContext {
    IncomingEventContext::new(StorageRecord::new(tenant, EventLatency::Normal, vec![1u8; size]))
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_start_relays_opened_notifications() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (_observer, pipeline) = started(config(&tmp_dir), MockPipeline::default());

    let notifications = pipeline.notifications.lock();
    assert!(notifications.contains(&StorageNotification::Opened {
        kind: "SQLite/Default".to_string()
    }));
    assert!(notifications.contains(&StorageNotification::Opened {
        kind: "Memory".to_string()
    }));
    assert_eq!(pipeline.events_of(DebugEventType::StorageOpened).len(), 2);
}

#[test]
fn test_start_fails_when_disk_cannot_open() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        db_path: tmp_dir.path().to_path_buf(),
        ..StorageConfig::default()
    };
    let pipeline = Arc::new(MockPipeline::default());
    let observer = StorageObserver::new(config, pipeline.clone());

    assert!(observer.on_start().is_err());
    assert!(observer.storage().is_none());
    assert!(pipeline
        .notifications
        .lock()
        .iter()
        .any(|n| matches!(n, StorageNotification::Failed { .. })));
    assert_eq!(pipeline.events_of(DebugEventType::StorageFailed).len(), 1);
}

#[test]
fn test_handlers_after_stop_fail_softly() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (observer, pipeline) = started(config(&tmp_dir), MockPipeline::default());
    assert!(observer.on_stop());

    let mut ctx = incoming("tenant", 4);
    assert!(!observer.on_incoming_record(&mut ctx));
    assert_eq!(*pipeline.store_failures.lock(), 1);

    let mut upload = EventsUploadContext::new(EventLatency::Off, 10);
    observer.on_retrieve_for_upload(&mut upload);
    assert_eq!(*pipeline.failed.lock(), 1);
    assert!(!observer.on_upload_acknowledged(&upload));
}

#[test]
fn test_stop_persists_buffered_records() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = config(&tmp_dir);
    {
        let (observer, _pipeline) = started(config.clone(), MockPipeline::default());
        for _ in 0..5 {
            assert!(observer.on_incoming_record(&mut incoming("tenant", 8)));
        }
        assert!(observer.on_stop());
    }

    let (observer, _pipeline) = started(config, MockPipeline::default());
    let storage = observer.storage().unwrap();
    assert_eq!(storage.disk().get_record_count(None), 5);
}

// ============================================================================
// UPLOAD FLOW
// ============================================================================

#[test]
fn test_retrieve_fills_context_and_acknowledge_deletes() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (observer, pipeline) = started(config(&tmp_dir), MockPipeline::default());
    let storage = observer.storage().unwrap();

    for _ in 0..3 {
        observer.on_incoming_record(&mut incoming("tenant", 10));
    }
    storage.flush();
    for _ in 0..2 {
        observer.on_incoming_record(&mut incoming("tenant", 10));
    }
    assert_eq!(pipeline.events_of(DebugEventType::Cached).len(), 5);

    let mut upload = EventsUploadContext::new(EventLatency::Off, 0);
    observer.on_retrieve_for_upload(&mut upload);

    assert_eq!(*pipeline.finished.lock(), 1);
    assert_eq!(upload.records.len(), 5);
    assert_eq!(pipeline.retrieved.lock().len(), 5);
    assert_eq!(upload.records[0].tier, Some(StorageTier::Memory));
    assert_eq!(upload.records[4].tier, Some(StorageTier::Disk));
    assert!(!upload.from_memory);

    // Ids are routed to the tier each record came from
    assert!(observer.on_upload_acknowledged(&upload));
    assert_eq!(storage.get_size(), 0);
    assert_eq!(storage.get_record_count(None), 0);
}

#[test]
fn test_pipeline_can_stop_retrieval_early() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let pipeline = MockPipeline {
        stop_after: 2,
        ..MockPipeline::default()
    };
    let (observer, _pipeline) = started(config(&tmp_dir), pipeline);

    for _ in 0..4 {
        observer.on_incoming_record(&mut incoming("tenant", 1));
    }

    let mut upload = EventsUploadContext::new(EventLatency::Off, 0);
    observer.on_retrieve_for_upload(&mut upload);
    assert_eq!(upload.records.len(), 2);
    assert!(upload.from_memory);

    let mut rest = EventsUploadContext::new(EventLatency::Off, 0);
    observer.on_retrieve_for_upload(&mut rest);
    assert_eq!(rest.records.len(), 2);
    assert!(rest.record_ids().iter().all(|id| !upload.record_ids().contains(id)));
}

#[test]
fn test_retryable_rejection_bumps_retry_and_dispatches_event() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        ram_queue_bytes: 0,
        ..config(&tmp_dir)
    };
    let (observer, pipeline) = started(config, MockPipeline::default());
    let storage = observer.storage().unwrap();
    observer.on_incoming_record(&mut incoming("tenant", 3));

    let mut upload = EventsUploadContext::new(EventLatency::Off, 0);
    observer.on_retrieve_for_upload(&mut upload);
    assert_eq!(upload.records.len(), 1);

    assert!(observer.on_upload_rejected_retryable(&upload));
    assert_eq!(pipeline.events_of(DebugEventType::SendRetry).len(), 1);
    assert_eq!(storage.disk().peek_records(0).unwrap()[0].retry_count, 1);

    let mut again = EventsUploadContext::new(EventLatency::Off, 0);
    observer.on_retrieve_for_upload(&mut again);
    assert!(observer.on_upload_rejected_final(&again));
    let row = &storage.disk().peek_records(0).unwrap()[0];
    assert_eq!(row.retry_count, 1);
    assert!(row.lease.is_none());
    assert_eq!(observer.stats().retried, 1);
    assert_eq!(observer.stats().rejected_final, 1);
}

#[test]
fn test_min_latency_filters_retrieval() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (observer, _pipeline) = started(config(&tmp_dir), MockPipeline::default());

    let mut low = IncomingEventContext::new(StorageRecord::new("t", EventLatency::Off, vec![1]));
    let mut high =
        IncomingEventContext::new(StorageRecord::new("t", EventLatency::RealTime, vec![1]));
    observer.on_incoming_record(&mut low);
    observer.on_incoming_record(&mut high);

    let mut upload = EventsUploadContext::new(EventLatency::Normal, 0);
    observer.on_retrieve_for_upload(&mut upload);
    assert_eq!(upload.records.len(), 1);
    assert_eq!(upload.records[0].latency, EventLatency::RealTime);
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[test]
fn test_rejected_record_reaches_both_channels() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (observer, pipeline) = started(config(&tmp_dir), MockPipeline::default());

    let mut bad = IncomingEventContext::new(StorageRecord::with_id(
        "",
        "acme",
        EventLatency::Normal,
        vec![1],
    ));
    assert!(!observer.on_incoming_record(&mut bad));

    let rejected = pipeline.events_of(DebugEventType::Rejected);
    assert_eq!(rejected, vec![DebugEvent::new(DebugEventType::Rejected, 1, 1)]);
    assert!(pipeline.notifications.lock().iter().any(|n| matches!(
        n,
        StorageNotification::RecordsRejected { counts } if counts.get("acme") == Some(&1)
    )));
}

#[test]
fn test_flush_reports_saved_count() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let (observer, pipeline) = started(config(&tmp_dir), MockPipeline::default());
    for _ in 0..4 {
        observer.on_incoming_record(&mut incoming("tenant", 2));
    }

    observer.storage().unwrap().flush();
    assert!(pipeline
        .notifications
        .lock()
        .contains(&StorageNotification::RecordsSaved { count: 4 }));
    assert_eq!(
        pipeline.events_of(DebugEventType::RecordsSaved),
        vec![DebugEvent::new(DebugEventType::RecordsSaved, 4, 4)]
    );
}

#[test]
fn test_nearly_full_reaches_diagnostic_channel() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        ram_queue_bytes: 100,
        ..config(&tmp_dir)
    };
    let (observer, pipeline) = started(config, MockPipeline::default());

    observer.on_incoming_record(&mut incoming("tenant", 80));
    let full = pipeline.events_of(DebugEventType::StorageFull);
    assert_eq!(full.len(), 1);
    assert_eq!(full[0].param1, 1);
    assert_eq!(full[0].size, 80);
}
