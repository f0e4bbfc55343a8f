//! Disk tier - SQLite database for durable record storage.
//!
//! # Schema
//! ```text
//! events(record_id TEXT PK, tenant_token, latency, timestamp, retry_count,
//!        reserved_until, lease_token, payload BLOB)
//! settings(name TEXT PK, value TEXT)
//! ```
//!
//! Rows are leased in rowid (insertion) order. A lease is the pair
//! `reserved_until`/`lease_token`; a row is available again once
//! `reserved_until <= now`, so expired leases need no sweep.

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::types::{
    BatchOutcome, HttpHeaders, Lease, RecordFilter, StorageRecord, StorageRecordId, StorageTier,
    TenantCounts,
};
use super::{OfflineStorage, OfflineStorageObserver, RecordConsumer};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::types::{now_ms, EventLatency};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        record_id TEXT PRIMARY KEY,
        tenant_token TEXT NOT NULL,
        latency INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        reserved_until INTEGER NOT NULL DEFAULT 0,
        lease_token TEXT,
        payload BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_available ON events (latency, reserved_until);
    CREATE TABLE IF NOT EXISTS settings (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const RECORD_COLUMNS: &str =
    "record_id, tenant_token, latency, timestamp, retry_count, payload, reserved_until, lease_token";

/// Open connection plus the byte count it is responsible for.
struct SqliteInner {
    conn: Connection,
    size: u64,
}

/// Durable tier backed by a single SQLite file.
pub struct SqliteStorage {
    path: PathBuf,
    /// `None` once shut down
    inner: Mutex<Option<SqliteInner>>,
    observer: Arc<dyn OfflineStorageObserver>,
    size_limit: u64,
    trim_target: u64,
    max_record_bytes: usize,
    last_read_count: AtomicUsize,
    transactions: AtomicU64,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .field("size", &self.get_size())
            .field("size_limit", &self.size_limit)
            .finish()
    }
}

impl SqliteStorage {
    /// Open or create the database at `config.db_path`.
    ///
    /// A file that cannot be opened as a database is deleted and recreated
    /// once; if that also fails the observer hears `on_storage_failed` and
    /// the error is returned.
    pub fn open(config: &StorageConfig, observer: Arc<dyn OfflineStorageObserver>) -> Result<Self> {
        Self::open_with(config, observer, true)
    }

    /// Open an existing database without ever deleting it.
    pub fn open_existing(
        config: &StorageConfig,
        observer: Arc<dyn OfflineStorageObserver>,
    ) -> Result<Self> {
        if !config.db_path.is_file() {
            return Err(StorageError::Open {
                path: config.db_path.clone(),
                reason: "no such database file".to_string(),
            });
        }
        Self::open_with(config, observer, false)
    }

    fn open_with(
        config: &StorageConfig,
        observer: Arc<dyn OfflineStorageObserver>,
        recreate: bool,
    ) -> Result<Self> {
        let path = config.db_path.clone();

        let (conn, kind) = match open_connection(&path) {
            Ok(conn) => (conn, "SQLite/Default"),
            Err(e) if !recreate => {
                let reason = format!("{}", e);
                observer.on_storage_failed(&reason);
                return Err(StorageError::Open { path, reason });
            }
            Err(first) => {
                warn!(
                    "Offline database {} is unusable ({}), recreating",
                    path.display(),
                    first
                );
                if let Err(e) = fs::remove_file(&path) {
                    debug!("Could not remove {}: {}", path.display(), e);
                }
                match open_connection(&path) {
                    Ok(conn) => (conn, "SQLite/Clean"),
                    Err(e) => {
                        let reason = format!("{}", e);
                        error!("Failed to open offline database {}: {}", path.display(), reason);
                        observer.on_storage_failed(&reason);
                        return Err(StorageError::Open { path, reason });
                    }
                }
            }
        };

        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM events",
            [],
            |row| row.get(0),
        )?;

        info!(
            "Opened offline database {} ({}, {} bytes resident)",
            path.display(),
            kind,
            size
        );
        observer.on_storage_opened(kind);

        Ok(Self {
            path,
            inner: Mutex::new(Some(SqliteInner {
                conn,
                size: size.max(0) as u64,
            })),
            observer,
            size_limit: config.disk_size_limit_bytes,
            trim_target: config.disk_trim_target(),
            max_record_bytes: config.max_record_bytes,
            last_read_count: AtomicUsize::new(0),
            transactions: AtomicU64::new(0),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of batch transactions committed since open.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut SqliteInner) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or(StorageError::Closed)?;
        f(inner)
    }

    fn validate(&self, record: &StorageRecord) -> std::result::Result<(), String> {
        if record.id.is_empty() {
            return Err("missing record id".to_string());
        }
        if record.tenant_token.is_empty() {
            return Err("missing tenant token".to_string());
        }
        if record.size() > self.max_record_bytes {
            return Err(format!(
                "payload of {} bytes exceeds {} byte limit",
                record.size(),
                self.max_record_bytes
            ));
        }
        Ok(())
    }

    fn trim_if_over_limit(&self, size: u64) {
        if size > self.size_limit {
            self.resize_db();
        }
    }

    /// Lease available rows and feed them to `consumer`; returns how many
    /// the consumer took.
    pub fn lease_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> Result<usize> {
        let now = now_ms();
        let token = Uuid::new_v4().to_string();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
        let reserved_until = now.saturating_add(lease_ms);
        let limit: i64 = if max_count == 0 { -1 } else { max_count as i64 };

        let batch = self.with_conn(|inner| {
            let tx = inner.conn.transaction()?;
            let records = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM events
                     WHERE latency >= ?1 AND reserved_until <= ?2
                     ORDER BY rowid LIMIT ?3",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![min_latency.as_i64(), sql_ms(now), limit], read_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for record in &records {
                tx.execute(
                    "UPDATE events SET reserved_until = ?1, lease_token = ?2 WHERE record_id = ?3",
                    params![sql_ms(reserved_until), token, record.id],
                )?;
            }
            tx.commit()?;
            Ok(records)
        })?;

        let mut consumed = 0;
        let mut pending = batch.into_iter();
        for mut record in pending.by_ref() {
            record.lease = Some(Lease::new(token.clone(), reserved_until));
            consumed += 1;
            if !consumer(record) {
                break;
            }
        }

        let unused: Vec<StorageRecordId> = pending.map(|r| r.id).collect();
        if !unused.is_empty() {
            self.with_conn(|inner| {
                let tx = inner.conn.transaction()?;
                for id in &unused {
                    tx.execute(
                        "UPDATE events SET reserved_until = 0, lease_token = NULL
                         WHERE record_id = ?1 AND lease_token = ?2",
                        params![id, token],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })?;
        }

        trace!("Disk storage leased {} record(s)", consumed);
        Ok(consumed)
    }

    /// Delete every record matching `filter`; returns the number removed.
    pub fn delete_records_where(&self, filter: &RecordFilter) -> Result<usize> {
        if filter.is_empty() {
            return Ok(0);
        }
        let tenant = filter.tenant_token.as_deref();
        let latency = filter.latency.map(EventLatency::as_i64);

        self.with_conn(|inner| {
            let tx = inner.conn.transaction()?;
            let freed: i64 = tx.query_row(
                "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM events
                 WHERE (?1 IS NULL OR tenant_token = ?1) AND (?2 IS NULL OR latency = ?2)",
                params![tenant, latency],
                |row| row.get(0),
            )?;
            let removed = tx.execute(
                "DELETE FROM events
                 WHERE (?1 IS NULL OR tenant_token = ?1) AND (?2 IS NULL OR latency = ?2)",
                params![tenant, latency],
            )?;
            tx.commit()?;
            inner.size = inner.size.saturating_sub(freed.max(0) as u64);
            Ok(removed)
        })
    }

    /// Read records without leasing them, oldest first.
    pub fn peek_records(&self, limit: usize) -> Result<Vec<StorageRecord>> {
        let limit: i64 = if limit == 0 { -1 } else { limit as i64 };
        self.with_conn(|inner| {
            let mut stmt = inner.conn.prepare(&format!(
                "SELECT {} FROM events ORDER BY rowid LIMIT ?1",
                RECORD_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], read_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// All stored settings, sorted by name.
    pub fn settings(&self) -> Result<Vec<(String, String)>> {
        self.with_conn(|inner| {
            let mut stmt = inner
                .conn
                .prepare("SELECT name, value FROM settings ORDER BY name")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

impl OfflineStorage for SqliteStorage {
    fn tier(&self) -> StorageTier {
        StorageTier::Disk
    }

    fn store_record(&self, record: StorageRecord) -> bool {
        if let Err(reason) = self.validate(&record) {
            warn!("Disk storage rejected record {:?}: {}", record.id, reason);
            let mut counts = TenantCounts::new();
            counts.insert(record.tenant_token, 1);
            self.observer.on_records_rejected(&counts);
            return false;
        }

        let result = self.with_conn(|inner| {
            let delta = insert_record(&inner.conn, &record)?;
            inner.size = apply_delta(inner.size, delta);
            Ok(inner.size)
        });

        match result {
            Ok(size) => {
                self.trim_if_over_limit(size);
                true
            }
            Err(e) => {
                warn!("Failed to store record {} on disk: {}", record.id, e);
                false
            }
        }
    }

    /// Write the batch inside one transaction.
    fn store_records(&self, records: Vec<StorageRecord>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut rejected = TenantCounts::new();
        let mut valid = Vec::with_capacity(records.len());

        for record in records {
            match self.validate(&record) {
                Ok(()) => valid.push(record),
                Err(reason) => {
                    warn!("Disk storage rejected record {:?}: {}", record.id, reason);
                    *rejected.entry(record.tenant_token.clone()).or_insert(0) += 1;
                    outcome.rejected.push(record);
                }
            }
        }
        if !rejected.is_empty() {
            self.observer.on_records_rejected(&rejected);
        }
        if valid.is_empty() {
            return outcome;
        }

        let result = self.with_conn(|inner| {
            let tx = inner.conn.transaction()?;
            let mut delta = 0i64;
            let mut failed = HashSet::new();
            for (i, record) in valid.iter().enumerate() {
                match insert_record(&tx, record) {
                    Ok(d) => delta += d,
                    Err(e) => {
                        debug!("Batch insert of {} failed: {}", record.id, e);
                        failed.insert(i);
                    }
                }
            }
            tx.commit()?;
            inner.size = apply_delta(inner.size, delta);
            Ok((failed, inner.size))
        });

        match result {
            Ok((failed, size)) => {
                self.transactions.fetch_add(1, Ordering::Relaxed);
                for (i, record) in valid.into_iter().enumerate() {
                    if failed.contains(&i) {
                        outcome.failed.push(record);
                    } else {
                        outcome.stored += 1;
                    }
                }
                self.trim_if_over_limit(size);
            }
            Err(e) => {
                warn!("Batch of {} record(s) failed to persist: {}", valid.len(), e);
                outcome.failed.extend(valid);
            }
        }
        outcome
    }

    fn get_and_reserve_records(
        &self,
        consumer: &mut RecordConsumer<'_>,
        lease: Duration,
        min_latency: EventLatency,
        max_count: usize,
    ) -> bool {
        match self.lease_records(consumer, lease, min_latency, max_count) {
            Ok(count) => {
                self.last_read_count.store(count, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("Failed to lease records from disk: {}", e);
                self.last_read_count.store(0, Ordering::Relaxed);
                false
            }
        }
    }

    fn last_read_record_count(&self) -> usize {
        self.last_read_count.load(Ordering::Relaxed)
    }

    fn delete_records(&self, ids: &[StorageRecordId], _headers: &HttpHeaders) -> bool {
        let result = self.with_conn(|inner| {
            let tx = inner.conn.transaction()?;
            let mut freed = 0i64;
            for id in ids {
                let len: Option<i64> = tx
                    .query_row(
                        "SELECT LENGTH(payload) FROM events WHERE record_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(len) = len {
                    tx.execute("DELETE FROM events WHERE record_id = ?1", params![id])?;
                    freed += len;
                }
            }
            tx.commit()?;
            inner.size = apply_delta(inner.size, -freed);
            Ok(())
        });

        match result {
            Ok(()) => {
                trace!("Deleted {} record(s) from disk", ids.len());
                true
            }
            Err(e) => {
                warn!("Failed to delete {} record(s) from disk: {}", ids.len(), e);
                false
            }
        }
    }

    fn release_records(
        &self,
        ids: &[StorageRecordId],
        increment_retry_count: bool,
        _headers: &HttpHeaders,
    ) -> bool {
        let bump: i64 = if increment_retry_count { 1 } else { 0 };
        let result = self.with_conn(|inner| {
            let tx = inner.conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE events SET reserved_until = 0, lease_token = NULL,
                     retry_count = retry_count + ?2 WHERE record_id = ?1",
                    params![id, bump],
                )?;
            }
            tx.commit()?;
            Ok(())
        });

        if let Err(e) = result {
            warn!("Failed to release {} record(s) on disk: {}", ids.len(), e);
            return false;
        }
        true
    }

    fn get_size(&self) -> usize {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |inner| inner.size as usize)
    }

    fn get_record_count(&self, latency: Option<EventLatency>) -> usize {
        let result = self.with_conn(|inner| {
            let count: i64 = inner.conn.query_row(
                "SELECT COUNT(*) FROM events WHERE ?1 IS NULL OR latency = ?1",
                params![latency.map(EventLatency::as_i64)],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        });
        result.unwrap_or(0)
    }

    /// Trim lowest-latency, oldest rows until the file's payload total is
    /// back under the trim target.
    fn resize_db(&self) -> bool {
        let result = self.with_conn(|inner| {
            if inner.size <= self.size_limit {
                return Ok(Vec::new());
            }
            let to_free = inner.size.saturating_sub(self.trim_target);

            let candidates: Vec<(String, String, i64)> = {
                let mut stmt = inner.conn.prepare(
                    "SELECT record_id, tenant_token, LENGTH(payload) FROM events
                     ORDER BY latency ASC, rowid ASC",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut freed = 0u64;
            let mut victims = Vec::new();
            for (id, tenant, len) in candidates {
                if freed >= to_free {
                    break;
                }
                freed += len.max(0) as u64;
                victims.push((id, tenant));
            }

            let tx = inner.conn.transaction()?;
            for (id, _) in &victims {
                tx.execute("DELETE FROM events WHERE record_id = ?1", params![id])?;
            }
            tx.commit()?;
            inner.size = inner.size.saturating_sub(freed);

            Ok(victims.into_iter().map(|(_, tenant)| tenant).collect::<Vec<_>>())
        });

        match result {
            Ok(tenants) => {
                if !tenants.is_empty() {
                    let mut counts = TenantCounts::new();
                    for tenant in tenants {
                        *counts.entry(tenant).or_insert(0) += 1;
                    }
                    let total: usize = counts.values().sum();
                    warn!("Trimmed {} record(s) from offline database", total);
                    self.observer.on_storage_trimmed(&counts);
                }
                true
            }
            Err(e) => {
                error!("Failed to trim offline database: {}", e);
                false
            }
        }
    }

    fn store_setting(&self, name: &str, value: &str) -> bool {
        let result = self.with_conn(|inner| {
            inner.conn.execute(
                "INSERT OR REPLACE INTO settings (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to store setting {}: {}", name, e);
            return false;
        }
        true
    }

    fn get_setting(&self, name: &str) -> Option<String> {
        let result = self.with_conn(|inner| {
            let value: Option<String> = inner
                .conn
                .query_row(
                    "SELECT value FROM settings WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        });
        match result {
            Ok(value) => value,
            Err(e) => {
                debug!("Failed to read setting {}: {}", name, e);
                None
            }
        }
    }

    fn delete_setting(&self, name: &str) -> bool {
        self.with_conn(|inner| {
            inner
                .conn
                .execute("DELETE FROM settings WHERE name = ?1", params![name])?;
            Ok(())
        })
        .is_ok()
    }

    fn shutdown(&self) {
        if self.inner.lock().take().is_some() {
            info!("Closed offline database {}", self.path.display());
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Upsert a record; returns the change in resident payload bytes.
fn insert_record(conn: &Connection, record: &StorageRecord) -> Result<i64> {
    let previous: Option<i64> = conn
        .query_row(
            "SELECT LENGTH(payload) FROM events WHERE record_id = ?1",
            params![record.id],
            |row| row.get(0),
        )
        .optional()?;

    let (reserved_until, lease_token) = match &record.lease {
        Some(lease) => (sql_ms(lease.reserved_until), Some(lease.token.as_str())),
        None => (0, None),
    };

    conn.execute(
        "INSERT OR REPLACE INTO events (
            record_id, tenant_token, latency, timestamp, retry_count, reserved_until, lease_token, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.tenant_token,
            record.latency.as_i64(),
            sql_ms(record.timestamp),
            record.retry_count as i64,
            reserved_until,
            lease_token,
            record.blob,
        ],
    )?;

    Ok(record.size() as i64 - previous.unwrap_or(0))
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<StorageRecord> {
    let reserved_until: i64 = row.get(6)?;
    let lease_token: Option<String> = row.get(7)?;
    Ok(StorageRecord {
        id: row.get(0)?,
        tenant_token: row.get(1)?,
        latency: EventLatency::from_i64(row.get(2)?),
        timestamp: row.get::<_, i64>(3)?.max(0) as u64,
        retry_count: row.get::<_, i64>(4)?.clamp(0, u32::MAX as i64) as u32,
        flush_failures: 0,
        blob: row.get(5)?,
        lease: lease_token.map(|token| Lease::new(token, reserved_until.max(0) as u64)),
        tier: Some(StorageTier::Disk),
    })
}

/// Millisecond timestamps are stored as INTEGER; far-future ones saturate.
fn sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn apply_delta(size: u64, delta: i64) -> u64 {
    if delta >= 0 {
        size.saturating_add(delta as u64)
    } else {
        size.saturating_sub(delta.unsigned_abs())
    }
}
