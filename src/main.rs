//! # Offline Storage Inspector
//!
//! Command-line tool for looking inside a disk tier database.
//!
//! Usage:
//!   offline-inspect --db <path> stats
//!   offline-inspect --db <path> settings
//!   offline-inspect --db <path> records [--limit N] [--format pretty|json]
//!
//! Without `--db` the path comes from `OFFLINE_STORAGE_PATH`, falling back
//! to the default database location.

use clap::{Parser, Subcommand};
use offline_storage::storage::{OfflineStorage, SqliteStorage, StorageRecord};
use offline_storage::types::now_ms;
use offline_storage::{EventLatency, NoopObserver, StorageConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "offline-inspect")]
#[command(about = "Inspect an offline telemetry storage database", long_about = None)]
struct Cli {
    /// Path to the disk tier database
    #[arg(short, long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts and sizes per latency
    Stats,

    /// List stored settings
    Settings,

    /// List stored records, oldest first
    Records {
        /// Maximum number of records to show (0 = all)
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output format: pretty, json
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
}

#[derive(Serialize)]
struct RecordRow<'a> {
    id: &'a str,
    tenant_token: &'a str,
    latency: EventLatency,
    timestamp: u64,
    retry_count: u32,
    size: usize,
    leased_until: Option<u64>,
}

impl<'a> From<&'a StorageRecord> for RecordRow<'a> {
    fn from(record: &'a StorageRecord) -> Self {
        let now = now_ms();
        RecordRow {
            id: &record.id,
            tenant_token: &record.tenant_token,
            latency: record.latency,
            timestamp: record.timestamp,
            retry_count: record.retry_count,
            size: record.size(),
            leased_until: record
                .lease
                .as_ref()
                .filter(|lease| lease.is_active(now))
                .map(|lease| lease.reserved_until),
        }
    }
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let env_config = StorageConfig::from_env().map_err(|e| e.to_string())?;
    let config = StorageConfig {
        db_path: cli.db.unwrap_or(env_config.db_path),
        disk_size_limit_bytes: u64::MAX,
        ..StorageConfig::default()
    };
    let storage = SqliteStorage::open_existing(&config, Arc::new(NoopObserver))
        .map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Stats => {
            println!("📊 Offline Storage Statistics\n");
            println!("Database:   {}", storage.path().display());
            println!("Records:    {}", storage.get_record_count(None));
            println!("Payload:    {} bytes", storage.get_size());
            println!();
            for latency in EventLatency::all() {
                println!(
                    "  - {:<14} {} record(s)",
                    latency.to_string(),
                    storage.get_record_count(Some(latency))
                );
            }
        }

        Commands::Settings => {
            let settings = storage.settings().map_err(|e| e.to_string())?;
            if settings.is_empty() {
                println!("No settings stored");
            }
            for (name, value) in settings {
                println!("{:<32} {}", name, value);
            }
        }

        Commands::Records { limit, format } => {
            let records = storage.peek_records(limit).map_err(|e| e.to_string())?;
            let rows: Vec<RecordRow<'_>> = records.iter().map(RecordRow::from).collect();

            match format.as_str() {
                "json" => {
                    let json = serde_json::to_string_pretty(&rows).map_err(|e| e.to_string())?;
                    println!("{}", json);
                }
                _ => {
                    println!("📋 {} record(s):\n", rows.len());
                    for row in &rows {
                        print_record(row);
                    }
                }
            }
        }
    }

    storage.shutdown();
    Ok(())
}

fn print_record(row: &RecordRow<'_>) {
    let lease = match row.leased_until {
        Some(until) => format!("leased until {}", until),
        None => "available".to_string(),
    };
    println!(
        "{} | {} | {} | {} bytes | {} retries | {}",
        row.id, row.tenant_token, row.latency, row.size, row.retry_count, lease
    );
}
