//! Rolling-window summaries over normalized daily aggregates.

use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::batch::{DailyAggregate, MetricFamily};
use crate::store::{DayRange, MAX_RANGE_DAYS};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Entries kept per family ranking.
pub const TOP_K: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRange {
    pub from: String,
    pub to: String,
    pub days: i64,
}

/// Per-family rankings, each an array of `[key, count]` pairs sorted by count
/// descending (key ascending on ties), at most [`TOP_K`] long.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopCounts {
    pub tools: Vec<(String, u64)>,
    pub ads: Vec<(String, u64)>,
    pub versions: Vec<(String, u64)>,
    pub versions_first_seen: Vec<(String, u64)>,
    pub lang_primary: Vec<(String, u64)>,
    pub lang_secondary: Vec<(String, u64)>,
    pub widgets: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub range: SummaryRange,
    pub total_app_open: u64,
    pub top: TopCounts,
}

/// Clamp a requested lookback length to the supported window.
pub fn clamp_window(last: i64) -> i64 {
    last.clamp(1, MAX_RANGE_DAYS)
}

/// Inclusive window ending on today's date in the given zone.
pub fn window_ending_today(tz: Tz, days: i64) -> (NaiveDate, NaiveDate) {
    let to = Utc::now().with_timezone(&tz).date_naive();
    let from = to - Duration::days(days - 1);
    (from, to)
}

/// Fold a range of daily aggregates into one summary.
pub fn summarize(range: &DayRange, days: &[DailyAggregate]) -> SummaryReport {
    let mut total_app_open = 0u64;
    let mut folded: BTreeMap<MetricFamily, BTreeMap<String, u64>> = BTreeMap::new();

    for aggregate in days {
        total_app_open += aggregate.totals.app_open;
        for family in MetricFamily::MAP_FAMILIES {
            let Some(map) = aggregate.totals.family_map(family) else {
                continue;
            };
            if map.is_empty() {
                continue;
            }
            let slot = folded.entry(family).or_default();
            for (key, count) in map {
                *slot.entry(key.clone()).or_insert(0) += count;
            }
        }
    }

    let mut top = TopCounts::default();
    for (family, counts) in &folded {
        let ranking = top_k(counts);
        match family {
            MetricFamily::Tools => top.tools = ranking,
            MetricFamily::Ads => top.ads = ranking,
            MetricFamily::Versions => top.versions = ranking,
            MetricFamily::VersionsFirstSeen => top.versions_first_seen = ranking,
            MetricFamily::LangPrimary => top.lang_primary = ranking,
            MetricFamily::LangSecondary => top.lang_secondary = ranking,
            MetricFamily::Widgets => top.widgets = ranking,
            MetricFamily::AppOpen => {}
        }
    }

    SummaryReport {
        range: SummaryRange {
            from: range.from_str(),
            to: range.to_str(),
            days: range.days,
        },
        total_app_open,
        top,
    }
}

fn top_k(counts: &BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> =
        counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_K);
    entries
}
