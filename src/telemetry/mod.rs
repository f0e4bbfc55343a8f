//! # Telemetry Module - upload pipeline adapter
//!
//! Connects an upload pipeline to the tiered offline store:
//! - producer records in ([`StorageObserver::on_incoming_record`])
//! - leased batches out ([`StorageObserver::on_retrieve_for_upload`])
//! - delivery outcomes back (acknowledged, retryable, final)
//! - storage notifications relayed to the pipeline

pub mod context;
pub mod observer;

pub use context::{
    DebugEvent, DebugEventType, EventsUploadContext, IncomingEventContext, StorageNotification,
    UploadPipeline, UploadRecordRef,
};
pub use observer::{ObserverStats, StorageObserver};
