//! # Pipeline Contexts
//!
//! Values exchanged between the upload pipeline and [`super::StorageObserver`],
//! plus the pipeline-side trait the observer calls back into.

use serde::Serialize;

use crate::storage::{HttpHeaders, StorageRecord, StorageRecordId, StorageTier, TenantCounts};
use crate::types::EventLatency;

/// A record arriving from a producer.
#[derive(Debug, Clone)]
pub struct IncomingEventContext {
    pub record: StorageRecord,
}

impl IncomingEventContext {
    pub fn new(record: StorageRecord) -> Self {
        Self { record }
    }
}

/// Identity of one record handed to the pipeline in an upload batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecordRef {
    pub id: StorageRecordId,
    pub tenant_token: String,
    pub latency: EventLatency,
    /// Tier the record was leased from
    pub tier: Option<StorageTier>,
}

/// State of one upload batch, from retrieval to acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct EventsUploadContext {
    /// Lowest latency the pipeline wants in this batch
    pub requested_min_latency: EventLatency,

    /// Batch size cap (0 = no cap)
    pub requested_max_count: usize,

    /// Records retrieved so far, in lease order
    pub records: Vec<UploadRecordRef>,

    /// Whether the last non-empty source of the batch was memory
    pub from_memory: bool,

    /// Headers of the collector's response, if one arrived
    pub response_headers: Option<HttpHeaders>,
}

impl EventsUploadContext {
    pub fn new(requested_min_latency: EventLatency, requested_max_count: usize) -> Self {
        Self {
            requested_min_latency,
            requested_max_count,
            ..Self::default()
        }
    }

    pub fn record_ids(&self) -> Vec<StorageRecordId> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Structured storage notification forwarded to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageNotification {
    Opened { kind: String },
    Failed { reason: String },
    Trimmed { counts: TenantCounts },
    RecordsDropped { counts: TenantCounts },
    RecordsRejected { counts: TenantCounts },
    RecordsSaved { count: usize },
    StorageFull { used_bytes: usize, limit_bytes: usize },
    Backpressure { size_before: usize, size_after: usize },
}

impl StorageNotification {
    /// Flatten into the diagnostic event carrying aggregate counts.
    pub fn debug_event(&self) -> DebugEvent {
        fn total(counts: &TenantCounts) -> u64 {
            counts.values().sum::<usize>() as u64
        }

        match self {
            Self::Opened { .. } => DebugEvent::new(DebugEventType::StorageOpened, 0, 0),
            Self::Failed { .. } => DebugEvent::new(DebugEventType::StorageFailed, 0, 0),
            Self::Trimmed { counts } | Self::RecordsDropped { counts } => {
                let n = total(counts);
                DebugEvent::new(DebugEventType::Dropped, n, n)
            }
            Self::RecordsRejected { counts } => {
                let n = total(counts);
                DebugEvent::new(DebugEventType::Rejected, n, n)
            }
            Self::RecordsSaved { count } => {
                DebugEvent::new(DebugEventType::RecordsSaved, *count as u64, *count as u64)
            }
            Self::StorageFull { used_bytes, .. } => {
                DebugEvent::new(DebugEventType::StorageFull, 1, *used_bytes as u64)
            }
            Self::Backpressure {
                size_before,
                size_after,
            } => DebugEvent::new(
                DebugEventType::Backpressure,
                *size_before as u64,
                *size_after as u64,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugEventType {
    Cached,
    SendRetry,
    StorageFull,
    Backpressure,
    StorageOpened,
    StorageFailed,
    RecordsSaved,
    Dropped,
    Rejected,
}

/// Generic diagnostic event for operational tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebugEvent {
    pub kind: DebugEventType,
    pub param1: u64,
    pub size: u64,
}

impl DebugEvent {
    pub fn new(kind: DebugEventType, param1: u64, size: u64) -> Self {
        Self { kind, param1, size }
    }
}

/// The upload pipeline as seen from storage.
///
/// Callbacks may run on any producer or consumer thread and must not block.
pub trait UploadPipeline: Send + Sync {
    /// A producer's record could not be stored.
    fn store_record_failed(&self, ctx: &IncomingEventContext);

    /// One leased record for the batch in `ctx`. Return `false` to stop
    /// retrieving.
    fn record_retrieved(&self, ctx: &mut EventsUploadContext, record: StorageRecord) -> bool;

    fn retrieval_finished(&self, ctx: &EventsUploadContext);

    fn retrieval_failed(&self, ctx: &EventsUploadContext);

    fn on_storage_notification(&self, _notification: &StorageNotification) {}

    fn dispatch_debug_event(&self, _event: &DebugEvent) {}
}
