//! Idempotent ingest pipeline - the sole write path into the store.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{info, warn};

use tally_common::batch::{IngestBatch, MetricFamily};
use tally_common::canonical::canonical_key;
use tally_common::store::{AggregateStore, ApplyOutcome, BatchApplication, CounterDelta};

use crate::audit::{AuditLogger, IngestAuditEntry};

/// Collapse a validated batch into canonical counter deltas.
///
/// Keys that canonicalize to a drop signal contribute nothing. Deltas landing
/// on the same canonical key accumulate here so the transaction carries one
/// increment per (day, family, key); zero deltas are skipped outright.
pub fn plan_deltas(batch: &IngestBatch) -> Vec<CounterDelta> {
    let mut acc: BTreeMap<(String, MetricFamily, String), u64> = BTreeMap::new();

    for item in &batch.items {
        if item.app_open > 0 {
            *acc.entry((item.day.clone(), MetricFamily::AppOpen, String::new()))
                .or_insert(0) += item.app_open;
        }
        for family in MetricFamily::MAP_FAMILIES {
            let Some(map) = item.family_map(family) else {
                continue;
            };
            for (raw_key, &delta) in map {
                if delta == 0 {
                    continue;
                }
                let Some(key) = canonical_key(family, raw_key) else {
                    continue;
                };
                *acc.entry((item.day.clone(), family, key)).or_insert(0) += delta;
            }
        }
    }

    acc.into_iter()
        .map(|((day, family, key), delta)| CounterDelta {
            day,
            family,
            key,
            delta,
        })
        .collect()
}

/// Apply a validated batch exactly once, then record it in the audit log.
///
/// The audit write happens after the commit and is best-effort: a failure is
/// logged and swallowed, never surfaced to the client whose data is already
/// durable.
pub async fn process_batch(
    store: &AggregateStore,
    audit: &AuditLogger,
    batch: &IngestBatch,
) -> Result<ApplyOutcome> {
    let deltas = plan_deltas(batch);
    let app_open_total: u64 = deltas
        .iter()
        .filter(|d| d.family == MetricFamily::AppOpen)
        .map(|d| d.delta)
        .sum();

    let application = BatchApplication {
        batch_id: batch.batch_id.clone(),
        platform: batch.platform.clone(),
        app_version: batch.app_version.clone(),
        item_count: batch.items.len(),
        deltas,
        received_at: Utc::now(),
    };

    let outcome = store.apply_batch(&application)?;

    match outcome {
        ApplyOutcome::Applied => {
            info!(
                batch_id = %batch.batch_id,
                platform = %batch.platform,
                items = batch.items.len(),
                "batch applied"
            );
            let entry = IngestAuditEntry {
                timestamp: application.received_at,
                batch_id: batch.batch_id.clone(),
                platform: batch.platform.clone(),
                app_version: batch.app_version.clone(),
                item_count: batch.items.len(),
                app_open_total,
            };
            if let Err(e) = audit.log(&entry).await {
                warn!(batch_id = %batch.batch_id, "audit log write failed: {e:#}");
            }
        }
        ApplyOutcome::AlreadyApplied => {
            info!(batch_id = %batch.batch_id, "duplicate batch ignored");
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::batch::BatchItem;

    fn batch_with_tools(tools: &[(&str, u64)]) -> IngestBatch {
        let mut item = BatchItem {
            day: "2025-03-15".to_string(),
            app_open: 1,
            ..Default::default()
        };
        for (key, count) in tools {
            item.tools.insert(key.to_string(), *count);
        }
        IngestBatch {
            batch_id: "b-001".to_string(),
            platform: "android".to_string(),
            app_version: "3.2.1".to_string(),
            items: vec![item],
        }
    }

    #[test]
    fn accumulates_aliases_into_one_delta() {
        // Both spellings of flashlight collapse before the store sees them.
        let batch = batch_with_tools(&[("tools.linterna", 2), ("flashlight", 3)]);
        let deltas = plan_deltas(&batch);

        let flashlight: Vec<&CounterDelta> = deltas
            .iter()
            .filter(|d| d.family == MetricFamily::Tools)
            .collect();
        assert_eq!(flashlight.len(), 1);
        assert_eq!(flashlight[0].key, "flashlight");
        assert_eq!(flashlight[0].delta, 5);
    }

    #[test]
    fn drops_retired_and_zero_deltas() {
        let batch = batch_with_tools(&[("dev", 7), ("dice", 0)]);
        let deltas = plan_deltas(&batch);
        assert!(deltas.iter().all(|d| d.family == MetricFamily::AppOpen));
    }

    #[test]
    fn splits_deltas_per_day() {
        let mut batch = batch_with_tools(&[("dice", 1)]);
        let mut second = batch.items[0].clone();
        second.day = "2025-03-16".to_string();
        batch.items.push(second);

        let deltas = plan_deltas(&batch);
        let days: Vec<&str> = deltas.iter().map(|d| d.day.as_str()).collect();
        assert!(days.contains(&"2025-03-15"));
        assert!(days.contains(&"2025-03-16"));
    }
}
