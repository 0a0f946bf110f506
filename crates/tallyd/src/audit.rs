//! Ingest audit log - append-only JSONL of successfully processed batches.
//!
//! Operational visibility only: written after the ingest transaction commits
//! and never read by any aggregation logic. A failed write must not fail the
//! already-committed ingest.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// One line per processed batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub batch_id: String,
    pub platform: String,
    pub app_version: String,
    pub item_count: usize,
    pub app_open_total: u64,
}

pub struct AuditLogger {
    log_path: PathBuf,
}

impl AuditLogger {
    pub async fn new(log_path: PathBuf) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)
                .await
                .context("Failed to create audit log directory")?;
        }

        info!("Ingest audit log: {}", log_path.display());

        Ok(Self { log_path })
    }

    /// Append one entry.
    pub async fn log(&self, entry: &IngestAuditEntry) -> Result<()> {
        let json = serde_json::to_string(entry)? + "\n";

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .context("Failed to open audit log")?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write audit entry")?;

        file.sync_all().await.context("Failed to sync audit log")?;

        Ok(())
    }

    /// Read all entries (for debugging/tests).
    pub async fn read_all(&self) -> Result<Vec<IngestAuditEntry>> {
        if !self.log_path.exists() {
            return Ok(vec![]);
        }

        let content = tokio::fs::read_to_string(&self.log_path)
            .await
            .context("Failed to read audit log")?;

        let entries: Vec<IngestAuditEntry> = content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
