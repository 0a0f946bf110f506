//! Tally daemon - analytics ingestion backend.
//!
//! Accepts batched usage-metric deltas from app clients, aggregates them into
//! per-day counters, and serves summarized reporting.

use anyhow::Result;
use tally_common::store::AggregateStore;
use tallyd::audit::AuditLogger;
use tallyd::config::TallyConfig;
use tallyd::server::{self, AppState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("tallyd v{} starting", env!("CARGO_PKG_VERSION"));

    let config = TallyConfig::load();
    if config.write_key.is_empty() {
        warn!("No write key configured; ingest requests will be rejected");
    }
    if config.read_key.is_empty() {
        warn!("No read key configured; reporting requires the write key");
    }

    let store = AggregateStore::open(&config.db_path)?;
    info!("Aggregation store ready: {}", config.db_path.display());

    let audit = AuditLogger::new(config.audit_log_path.clone()).await?;

    server::run(AppState::new(store, audit, config)).await
}
