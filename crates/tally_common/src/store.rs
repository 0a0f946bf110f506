//! Durable per-day counter storage.
//!
//! One SQLite database holds every daily aggregate, partitioned by month
//! through an indexed `month` column so reporting scans stay bounded. All
//! counter writes are relative deltas applied with `ON CONFLICT .. value =
//! value + excluded.value`; nothing in this module ever reads a counter and
//! writes back a computed sum. The idempotence guard for a batch and every
//! increment of that batch commit in one IMMEDIATE transaction.
//!
//! Reads tolerate heterogeneous historical rows: older pipelines wrote keys
//! with family prefixes and pre-rename names, so every key read here passes
//! through the canonicalizer and collisions are summed.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::batch::{DailyAggregate, DailyMeta, DailyTotals, MetricFamily};
use crate::canonical::canonical_key;

/// Longest day range a single read may cover.
pub const MAX_RANGE_DAYS: i64 = 400;

const DAY_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range bounds must be YYYY-MM-DD with from <= to")]
    Invalid,
    #[error("range covers more than {MAX_RANGE_DAYS} days")]
    TooLarge,
}

/// A validated inclusive day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub days: i64,
}

impl DayRange {
    pub fn from_str(&self) -> String {
        self.from.format(DAY_FMT).to_string()
    }

    pub fn to_str(&self) -> String {
        self.to.format(DAY_FMT).to_string()
    }
}

/// Validate range bounds before any query runs.
pub fn parse_range(from: &str, to: &str) -> Result<DayRange, RangeError> {
    let from = NaiveDate::parse_from_str(from, DAY_FMT).map_err(|_| RangeError::Invalid)?;
    let to = NaiveDate::parse_from_str(to, DAY_FMT).map_err(|_| RangeError::Invalid)?;
    if from > to {
        return Err(RangeError::Invalid);
    }
    let days = (to - from).num_days() + 1;
    if days > MAX_RANGE_DAYS {
        return Err(RangeError::TooLarge);
    }
    Ok(DayRange { from, to, days })
}

/// One queued increment against a day's aggregate. The `(family, key)` pair
/// is the multi-segment path: dynamic keys such as dotted version strings are
/// plain values here, never concatenated into a path string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub day: String,
    pub family: MetricFamily,
    pub key: String,
    pub delta: u64,
}

/// Everything the store needs to apply one batch atomically.
#[derive(Debug, Clone)]
pub struct BatchApplication {
    pub batch_id: String,
    pub platform: String,
    pub app_version: String,
    pub item_count: usize,
    pub deltas: Vec<CounterDelta>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The guard was absent; deltas were applied and the guard created.
    Applied,
    /// The guard already existed; nothing was touched.
    AlreadyApplied,
}

/// SQLite-backed aggregation store.
#[derive(Clone)]
pub struct AggregateStore {
    conn: Arc<Mutex<Connection>>,
}

impl AggregateStore {
    /// Open or create the store at a path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS daily_counters (
                month  TEXT NOT NULL,
                day    TEXT NOT NULL,
                family TEXT NOT NULL,
                key    TEXT NOT NULL,
                value  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, family, key)
            );

            CREATE INDEX IF NOT EXISTS idx_counters_month ON daily_counters(month);

            CREATE TABLE IF NOT EXISTS daily_meta (
                day           TEXT PRIMARY KEY,
                month         TEXT NOT NULL,
                updated_at    TEXT,
                seen_versions TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS ingest_guards (
                batch_id    TEXT PRIMARY KEY,
                platform    TEXT NOT NULL,
                app_version TEXT NOT NULL,
                item_count  INTEGER NOT NULL,
                received_at TEXT NOT NULL
            );
            "#,
        )
        .context("failed to initialize aggregation schema")?;
        Ok(())
    }

    /// Apply one batch exactly once.
    ///
    /// The guard check, guard insert and every counter increment run in a
    /// single IMMEDIATE transaction, so a concurrent retry of the same batch
    /// id sees either the committed guard (and applies nothing) or waits for
    /// the write lock and then sees it.
    pub fn apply_batch(&self, batch: &BatchApplication) -> Result<ApplyOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin ingest transaction")?;

        let guard_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM ingest_guards WHERE batch_id = ?",
                params![batch.batch_id],
                |row| row.get(0),
            )
            .optional()?;
        if guard_exists.is_some() {
            debug!(batch_id = %batch.batch_id, "guard present, skipping batch");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let now = batch.received_at.to_rfc3339();
        tx.execute(
            "INSERT INTO ingest_guards (batch_id, platform, app_version, item_count, received_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                batch.batch_id,
                batch.platform,
                batch.app_version,
                batch.item_count as i64,
                now
            ],
        )?;

        for delta in &batch.deltas {
            tx.execute(
                "INSERT INTO daily_counters (month, day, family, key, value)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(day, family, key) DO UPDATE SET value = value + excluded.value",
                params![
                    month_of(&delta.day),
                    delta.day,
                    delta.family.as_str(),
                    delta.key,
                    delta.delta as i64
                ],
            )?;
        }

        let mut days: Vec<&str> = batch.deltas.iter().map(|d| d.day.as_str()).collect();
        days.sort_unstable();
        days.dedup();
        for day in days {
            upsert_meta(&tx, day, &now, &batch.platform, &batch.app_version)?;
        }

        tx.commit().context("failed to commit ingest transaction")?;
        debug!(
            batch_id = %batch.batch_id,
            increments = batch.deltas.len(),
            "batch committed"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Fetch and normalize every daily aggregate in a validated range,
    /// ascending by day. Spans month partitions as needed.
    pub fn fetch_range(&self, range: &DayRange) -> Result<Vec<DailyAggregate>> {
        let conn = self.conn.lock().unwrap();
        let from = range.from_str();
        let to = range.to_str();
        let months = months_in_range(range.from, range.to);
        let placeholders = vec!["?"; months.len()].join(",");

        let mut by_day: BTreeMap<String, DailyTotals> = BTreeMap::new();
        let mut meta_by_day: BTreeMap<String, DailyMeta> = BTreeMap::new();

        {
            let sql = format!(
                "SELECT day, updated_at FROM daily_meta
                 WHERE month IN ({placeholders}) AND day >= ? AND day <= ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut args: Vec<&dyn rusqlite::ToSql> =
                months.iter().map(|m| m as &dyn rusqlite::ToSql).collect();
            args.push(&from);
            args.push(&to);
            let rows = stmt.query_map(args.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            for row in rows {
                let (day, updated_at) = row?;
                let updated_at = updated_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                by_day.entry(day.clone()).or_default();
                meta_by_day.insert(day, DailyMeta { updated_at });
            }
        }

        {
            let sql = format!(
                "SELECT day, family, key, value FROM daily_counters
                 WHERE month IN ({placeholders}) AND day >= ? AND day <= ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut args: Vec<&dyn rusqlite::ToSql> =
                months.iter().map(|m| m as &dyn rusqlite::ToSql).collect();
            args.push(&from);
            args.push(&to);
            let rows = stmt.query_map(args.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (day, family, key, value) = row?;
                let totals = by_day.entry(day).or_default();
                merge_counter(totals, &family, &key, value.max(0) as u64);
            }
        }

        Ok(by_day
            .into_iter()
            .map(|(day, totals)| DailyAggregate {
                meta: meta_by_day.remove(&day).unwrap_or_default(),
                day,
                totals,
            })
            .collect())
    }

    /// Whether a guard record exists for a batch id.
    pub fn guard_exists(&self, batch_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM ingest_guards WHERE batch_id = ?",
                params![batch_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Merge one physical counter row into the normalized view. Keys are
/// canonicalized, so a legacy `tools.linterna` row and a canonical
/// `flashlight` row land in the same bucket and their values sum.
fn merge_counter(totals: &mut DailyTotals, family: &str, key: &str, value: u64) {
    let Some(family) = MetricFamily::parse(family) else {
        return;
    };
    match family {
        MetricFamily::AppOpen => totals.app_open += value,
        map_family => {
            let Some(canonical) = canonical_key(map_family, key) else {
                return;
            };
            if let Some(map) = totals.family_map_mut(map_family) {
                *map.entry(canonical).or_insert(0) += value;
            }
        }
    }
}

fn upsert_meta(
    tx: &rusqlite::Transaction<'_>,
    day: &str,
    now: &str,
    platform: &str,
    app_version: &str,
) -> Result<()> {
    let seen: Option<String> = tx
        .query_row(
            "SELECT seen_versions FROM daily_meta WHERE day = ?",
            params![day],
            |row| row.get(0),
        )
        .optional()?;
    let mut seen: serde_json::Value = seen
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    seen[platform][app_version] = serde_json::Value::Bool(true);

    tx.execute(
        "INSERT INTO daily_meta (day, month, updated_at, seen_versions)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(day) DO UPDATE SET
             updated_at = excluded.updated_at,
             seen_versions = excluded.seen_versions",
        params![day, month_of(day), now, seen.to_string()],
    )?;
    Ok(())
}

fn month_of(day: &str) -> &str {
    day.get(..7).unwrap_or(day)
}

/// `YYYY-MM` strings for every month the range touches.
fn months_in_range(from: NaiveDate, to: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let mut cursor = from.with_day(1).unwrap_or(from);
    while cursor <= to {
        months.push(cursor.format("%Y-%m").to_string());
        let (year, month) = if cursor.month() == 12 {
            (cursor.year() + 1, 1)
        } else {
            (cursor.year(), cursor.month() + 1)
        };
        match NaiveDate::from_ymd_opt(year, month, 1) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    months
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(day: &str, family: MetricFamily, key: &str, n: u64) -> CounterDelta {
        CounterDelta {
            day: day.to_string(),
            family,
            key: key.to_string(),
            delta: n,
        }
    }

    fn application(batch_id: &str, deltas: Vec<CounterDelta>) -> BatchApplication {
        BatchApplication {
            batch_id: batch_id.to_string(),
            platform: "android".to_string(),
            app_version: "3.2.1".to_string(),
            item_count: 1,
            deltas,
            received_at: Utc::now(),
        }
    }

    fn range(from: &str, to: &str) -> DayRange {
        parse_range(from, to).unwrap()
    }

    #[test]
    fn applies_and_reads_back() {
        let store = AggregateStore::open_in_memory().unwrap();
        store
            .apply_batch(&application(
                "b1",
                vec![
                    delta("2025-03-15", MetricFamily::AppOpen, "", 2),
                    delta("2025-03-15", MetricFamily::Tools, "flashlight", 3),
                ],
            ))
            .unwrap();

        let days = store.fetch_range(&range("2025-03-01", "2025-03-31")).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].day, "2025-03-15");
        assert_eq!(days[0].totals.app_open, 2);
        assert_eq!(days[0].totals.tools["flashlight"], 3);
        assert!(days[0].meta.updated_at.is_some());
    }

    #[test]
    fn duplicate_batch_id_applies_nothing() {
        let store = AggregateStore::open_in_memory().unwrap();
        let batch = application(
            "b1",
            vec![delta("2025-03-15", MetricFamily::Tools, "dice", 5)],
        );

        assert_eq!(store.apply_batch(&batch).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            store.apply_batch(&batch).unwrap(),
            ApplyOutcome::AlreadyApplied
        );

        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        assert_eq!(days[0].totals.tools["dice"], 5);
        assert!(store.guard_exists("b1").unwrap());
    }

    #[test]
    fn distinct_batches_sum_into_the_same_counter() {
        let store = AggregateStore::open_in_memory().unwrap();
        store
            .apply_batch(&application(
                "b1",
                vec![delta("2025-03-15", MetricFamily::Tools, "flashlight", 4)],
            ))
            .unwrap();
        store
            .apply_batch(&application(
                "b2",
                vec![delta("2025-03-15", MetricFamily::Tools, "flashlight", 6)],
            ))
            .unwrap();

        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        assert_eq!(days[0].totals.tools["flashlight"], 10);
    }

    #[test]
    fn normalizes_mixed_shape_rows() {
        let store = AggregateStore::open_in_memory().unwrap();
        // A canonical row and a legacy flattened row for the same logical key.
        store
            .apply_batch(&application(
                "b1",
                vec![delta("2025-03-15", MetricFamily::Tools, "dice", 2)],
            ))
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO daily_counters (month, day, family, key, value)
                 VALUES ('2025-03', '2025-03-15', 'tools', 'tools.dice', 3)",
                [],
            )
            .unwrap();
        }

        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        assert_eq!(days[0].totals.tools["dice"], 5);
    }

    #[test]
    fn legacy_rows_canonicalize_on_read() {
        let store = AggregateStore::open_in_memory().unwrap();
        let conn = store.conn.clone();
        {
            let conn = conn.lock().unwrap();
            conn.execute_batch(
                "INSERT INTO daily_counters VALUES ('2025-03', '2025-03-15', 'tools', 'linterna', 2);
                 INSERT INTO daily_counters VALUES ('2025-03', '2025-03-15', 'tools', 'flashlight', 1);
                 INSERT INTO daily_counters VALUES ('2025-03', '2025-03-15', 'tools', 'dev', 9);",
            )
            .unwrap();
        }

        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        // Pre-rename and canonical spellings merge; retired keys vanish.
        assert_eq!(days[0].totals.tools["flashlight"], 3);
        assert!(!days[0].totals.tools.contains_key("linterna"));
        assert!(!days[0].totals.tools.contains_key("dev"));
    }

    #[test]
    fn range_spans_months_sorted_ascending() {
        let store = AggregateStore::open_in_memory().unwrap();
        store
            .apply_batch(&application(
                "b1",
                vec![
                    delta("2025-03-31", MetricFamily::AppOpen, "", 1),
                    delta("2025-04-01", MetricFamily::AppOpen, "", 2),
                    delta("2025-02-28", MetricFamily::AppOpen, "", 3),
                ],
            ))
            .unwrap();

        let days = store.fetch_range(&range("2025-02-01", "2025-04-30")).unwrap();
        let listed: Vec<&str> = days.iter().map(|d| d.day.as_str()).collect();
        assert_eq!(listed, vec!["2025-02-28", "2025-03-31", "2025-04-01"]);
    }

    #[test]
    fn version_keys_with_dots_stay_intact() {
        let store = AggregateStore::open_in_memory().unwrap();
        store
            .apply_batch(&application(
                "b1",
                vec![delta("2025-03-15", MetricFamily::Versions, "3.2.1", 7)],
            ))
            .unwrap();

        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        assert_eq!(days[0].totals.versions["3.2.1"], 7);
    }

    #[test]
    fn rejects_bad_ranges() {
        assert_eq!(parse_range("2025-03-15", "2025-03-01"), Err(RangeError::Invalid));
        assert_eq!(parse_range("garbage", "2025-03-01"), Err(RangeError::Invalid));
        assert_eq!(parse_range("2024-01-01", "2025-06-01"), Err(RangeError::TooLarge));
        // 400 days exactly is allowed.
        assert!(parse_range("2024-01-01", "2025-02-04").is_ok());
    }

    #[test]
    fn months_enumerated_across_year_boundary() {
        let months = months_in_range(
            NaiveDate::from_ymd_opt(2024, 11, 15).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(),
        );
        assert_eq!(months, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);
    }

    #[test]
    fn seen_versions_accumulate_per_day() {
        let store = AggregateStore::open_in_memory().unwrap();
        let mut batch = application(
            "b1",
            vec![delta("2025-03-15", MetricFamily::AppOpen, "", 1)],
        );
        store.apply_batch(&batch).unwrap();
        batch.batch_id = "b2".to_string();
        batch.platform = "ios".to_string();
        batch.app_version = "3.3.0".to_string();
        store.apply_batch(&batch).unwrap();

        let conn = store.conn.lock().unwrap();
        let seen: String = conn
            .query_row(
                "SELECT seen_versions FROM daily_meta WHERE day = '2025-03-15'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let seen: serde_json::Value = serde_json::from_str(&seen).unwrap();
        assert_eq!(seen["android"]["3.2.1"], true);
        assert_eq!(seen["ios"]["3.3.0"], true);
    }

    #[test]
    fn opens_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregates.db");
        {
            let store = AggregateStore::open(&path).unwrap();
            store
                .apply_batch(&application(
                    "b1",
                    vec![delta("2025-03-15", MetricFamily::AppOpen, "", 1)],
                ))
                .unwrap();
        }
        let store = AggregateStore::open(&path).unwrap();
        let days = store.fetch_range(&range("2025-03-15", "2025-03-15")).unwrap();
        assert_eq!(days[0].totals.app_open, 1);
    }
}
