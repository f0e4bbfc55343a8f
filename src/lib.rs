//! # Offline Storage
//!
//! Tiered offline persistence for telemetry events: a bounded memory tier,
//! a durable SQLite tier, the orchestrator that flushes one into the other,
//! and the lease protocol an upload pipeline consumes records through.

pub mod config;
pub mod error;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use storage::{
    MemoryStorage, NoopObserver, OfflineStorage, OfflineStorageObserver, SqliteStorage,
    StorageRecord, TieredStorage,
};
pub use telemetry::{StorageObserver, UploadPipeline};
pub use types::EventLatency;
