//! Offline storage configuration.
//!
//! Captured by value when the orchestrator opens; nothing here is read
//! lazily afterwards.

use crate::error::{Result, StorageError};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Nearly-full threshold used when `ram_full_pct` is out of range.
pub const DEFAULT_RAM_FULL_PCT: u32 = 75;

/// Configuration for the tiered offline store.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the disk tier database (SQLite)
    pub db_path: PathBuf,

    /// Memory tier quota in bytes. 0 disables the memory tier.
    pub ram_queue_bytes: usize,

    /// Nearly-full notification threshold, percent of `ram_queue_bytes`
    pub ram_full_pct: u32,

    /// Hard bound for the disk tier in bytes
    pub disk_size_limit_bytes: u64,

    /// Percentage of the disk bound freed by a trim
    pub disk_trim_pct: u32,

    /// Records with a larger payload are rejected
    pub max_record_bytes: usize,

    /// Lease requested by the upload adapter
    #[serde(with = "duration_ms")]
    pub upload_lease: Duration,

    /// How many failed flush attempts a record survives before it is dropped
    pub max_flush_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./var/data/offline_storage.db"),
            ram_queue_bytes: 512 * 1024,
            ram_full_pct: DEFAULT_RAM_FULL_PCT,
            disk_size_limit_bytes: 3 * 1024 * 1024,
            disk_trim_pct: 25,
            max_record_bytes: 2 * 1024 * 1024,
            upload_lease: Duration::from_secs(120),
            max_flush_retries: 3,
        }
    }
}

impl StorageConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Recognised variables: `OFFLINE_STORAGE_PATH`,
    /// `OFFLINE_STORAGE_RAM_QUEUE_BYTES`, `OFFLINE_STORAGE_RAM_FULL_PCT`,
    /// `OFFLINE_STORAGE_DISK_LIMIT_BYTES`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("OFFLINE_STORAGE_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(bytes) = env_number("OFFLINE_STORAGE_RAM_QUEUE_BYTES")? {
            config.ram_queue_bytes = usize::try_from(bytes).unwrap_or(usize::MAX);
        }
        if let Some(pct) = env_number("OFFLINE_STORAGE_RAM_FULL_PCT")? {
            config.ram_full_pct = u32::try_from(pct).unwrap_or(u32::MAX);
        }
        if let Some(bytes) = env_number("OFFLINE_STORAGE_DISK_LIMIT_BYTES")? {
            config.disk_size_limit_bytes = bytes;
        }

        Ok(config)
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Byte count above which the memory tier reports "nearly full".
    pub fn memory_notification_limit(&self) -> usize {
        let pct = if self.ram_full_pct > 0 && self.ram_full_pct <= 100 {
            self.ram_full_pct
        } else {
            DEFAULT_RAM_FULL_PCT
        };
        (pct as usize).saturating_mul(self.ram_queue_bytes) / 100
    }

    /// Size the disk tier is trimmed down to once it exceeds its bound.
    pub fn disk_trim_target(&self) -> u64 {
        let keep = 100 - u64::from(self.disk_trim_pct.min(100));
        self.disk_size_limit_bytes.saturating_mul(keep) / 100
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StorageError::Config(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.ram_full_pct, 75);
        assert_eq!(config.upload_lease.as_secs(), 120);
        assert_eq!(config.memory_notification_limit(), 384 * 1024);
    }

    #[test]
    fn test_bad_percentage_falls_back_to_75() {
        for pct in [0, 101, 5000] {
            let config = StorageConfig {
                ram_queue_bytes: 1000,
                ram_full_pct: pct,
                ..StorageConfig::default()
            };
            assert_eq!(config.memory_notification_limit(), 750);
        }

        let config = StorageConfig {
            ram_queue_bytes: 1000,
            ram_full_pct: 40,
            ..StorageConfig::default()
        };
        assert_eq!(config.memory_notification_limit(), 400);
    }

    #[test]
    fn test_config_from_json() {
        let config = StorageConfig::from_json(
            r#"{"db_path": "/tmp/x.db", "ram_queue_bytes": 0, "upload_lease": 5000}"#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.ram_queue_bytes, 0);
        assert_eq!(config.upload_lease, Duration::from_secs(5));
        assert_eq!(config.disk_trim_pct, 25);
    }

    #[test]
    fn test_trim_target() {
        let config = StorageConfig {
            disk_size_limit_bytes: 1000,
            disk_trim_pct: 25,
            ..StorageConfig::default()
        };
        assert_eq!(config.disk_trim_target(), 750);

        // Small bounds keep their share instead of rounding to zero
        let config = StorageConfig {
            disk_size_limit_bytes: 40,
            disk_trim_pct: 25,
            ..StorageConfig::default()
        };
        assert_eq!(config.disk_trim_target(), 30);
    }

    #[test]
    fn test_config_from_env() {
        let vars = [
            "OFFLINE_STORAGE_PATH",
            "OFFLINE_STORAGE_RAM_QUEUE_BYTES",
            "OFFLINE_STORAGE_RAM_FULL_PCT",
            "OFFLINE_STORAGE_DISK_LIMIT_BYTES",
        ];

        std::env::set_var("OFFLINE_STORAGE_PATH", "/tmp/env-offline.db");
        std::env::set_var("OFFLINE_STORAGE_RAM_QUEUE_BYTES", "2048");
        std::env::set_var("OFFLINE_STORAGE_RAM_FULL_PCT", " 50 ");
        std::env::set_var("OFFLINE_STORAGE_DISK_LIMIT_BYTES", "4096");
        let config = StorageConfig::from_env().unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/env-offline.db"));
        assert_eq!(config.ram_queue_bytes, 2048);
        assert_eq!(config.memory_notification_limit(), 1024);
        assert_eq!(config.disk_size_limit_bytes, 4096);
        assert_eq!(config.disk_trim_pct, 25);

        std::env::set_var("OFFLINE_STORAGE_RAM_QUEUE_BYTES", "lots");
        let err = StorageConfig::from_env().unwrap_err();
        assert!(matches!(err, StorageError::Config(ref msg) if msg.contains("OFFLINE_STORAGE_RAM_QUEUE_BYTES")));

        for var in vars {
            std::env::remove_var(var);
        }
        assert_eq!(
            StorageConfig::from_env().unwrap().ram_queue_bytes,
            StorageConfig::default().ram_queue_bytes
        );
    }
}
