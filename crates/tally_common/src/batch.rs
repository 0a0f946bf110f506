//! Wire and document types shared between the ingest and reporting paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric counter families carried by a daily aggregate.
///
/// `AppOpen` is the single scalar counter; every other family is a map from a
/// dynamic key (tool id, ad surface, version string, language code, widget
/// kind) to a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricFamily {
    AppOpen,
    Tools,
    Ads,
    Versions,
    VersionsFirstSeen,
    LangPrimary,
    LangSecondary,
    Widgets,
}

impl MetricFamily {
    /// The map-valued families, in wire order.
    pub const MAP_FAMILIES: [MetricFamily; 7] = [
        MetricFamily::Tools,
        MetricFamily::Ads,
        MetricFamily::Versions,
        MetricFamily::VersionsFirstSeen,
        MetricFamily::LangPrimary,
        MetricFamily::LangSecondary,
        MetricFamily::Widgets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::AppOpen => "app_open",
            MetricFamily::Tools => "tools",
            MetricFamily::Ads => "ads",
            MetricFamily::Versions => "versions",
            MetricFamily::VersionsFirstSeen => "versions_first_seen",
            MetricFamily::LangPrimary => "lang_primary",
            MetricFamily::LangSecondary => "lang_secondary",
            MetricFamily::Widgets => "widgets",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app_open" => Some(MetricFamily::AppOpen),
            "tools" => Some(MetricFamily::Tools),
            "ads" => Some(MetricFamily::Ads),
            "versions" => Some(MetricFamily::Versions),
            "versions_first_seen" => Some(MetricFamily::VersionsFirstSeen),
            "lang_primary" => Some(MetricFamily::LangPrimary),
            "lang_secondary" => Some(MetricFamily::LangSecondary),
            "widgets" => Some(MetricFamily::Widgets),
            _ => None,
        }
    }
}

/// One client submission: a set of per-day delta items under a unique,
/// client-generated batch id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub batch_id: String,
    pub platform: String,
    pub app_version: String,
    pub items: Vec<BatchItem>,
}

/// Deltas a client reports for one calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub day: String,
    #[serde(default)]
    pub app_open: u64,
    #[serde(default)]
    pub tools: BTreeMap<String, u64>,
    #[serde(default)]
    pub ads: BTreeMap<String, u64>,
    #[serde(default)]
    pub versions: BTreeMap<String, u64>,
    #[serde(default)]
    pub versions_first_seen: BTreeMap<String, u64>,
    #[serde(default)]
    pub lang_primary: BTreeMap<String, u64>,
    #[serde(default)]
    pub lang_secondary: BTreeMap<String, u64>,
    #[serde(default)]
    pub widgets: BTreeMap<String, u64>,
}

impl BatchItem {
    /// Map for one family; `None` for `AppOpen`.
    pub fn family_map(&self, family: MetricFamily) -> Option<&BTreeMap<String, u64>> {
        match family {
            MetricFamily::AppOpen => None,
            MetricFamily::Tools => Some(&self.tools),
            MetricFamily::Ads => Some(&self.ads),
            MetricFamily::Versions => Some(&self.versions),
            MetricFamily::VersionsFirstSeen => Some(&self.versions_first_seen),
            MetricFamily::LangPrimary => Some(&self.lang_primary),
            MetricFamily::LangSecondary => Some(&self.lang_secondary),
            MetricFamily::Widgets => Some(&self.widgets),
        }
    }

    pub fn family_map_mut(&mut self, family: MetricFamily) -> Option<&mut BTreeMap<String, u64>> {
        match family {
            MetricFamily::AppOpen => None,
            MetricFamily::Tools => Some(&mut self.tools),
            MetricFamily::Ads => Some(&mut self.ads),
            MetricFamily::Versions => Some(&mut self.versions),
            MetricFamily::VersionsFirstSeen => Some(&mut self.versions_first_seen),
            MetricFamily::LangPrimary => Some(&mut self.lang_primary),
            MetricFamily::LangSecondary => Some(&mut self.lang_secondary),
            MetricFamily::Widgets => Some(&mut self.widgets),
        }
    }
}

/// Normalized counter totals for one day. Always carries every family so the
/// wire shape is stable regardless of which counters a day actually saw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyTotals {
    pub app_open: u64,
    pub tools: BTreeMap<String, u64>,
    pub ads: BTreeMap<String, u64>,
    pub versions: BTreeMap<String, u64>,
    pub versions_first_seen: BTreeMap<String, u64>,
    pub lang_primary: BTreeMap<String, u64>,
    pub lang_secondary: BTreeMap<String, u64>,
    pub widgets: BTreeMap<String, u64>,
}

impl DailyTotals {
    pub fn family_map(&self, family: MetricFamily) -> Option<&BTreeMap<String, u64>> {
        match family {
            MetricFamily::AppOpen => None,
            MetricFamily::Tools => Some(&self.tools),
            MetricFamily::Ads => Some(&self.ads),
            MetricFamily::Versions => Some(&self.versions),
            MetricFamily::VersionsFirstSeen => Some(&self.versions_first_seen),
            MetricFamily::LangPrimary => Some(&self.lang_primary),
            MetricFamily::LangSecondary => Some(&self.lang_secondary),
            MetricFamily::Widgets => Some(&self.widgets),
        }
    }

    pub fn family_map_mut(&mut self, family: MetricFamily) -> Option<&mut BTreeMap<String, u64>> {
        match family {
            MetricFamily::AppOpen => None,
            MetricFamily::Tools => Some(&mut self.tools),
            MetricFamily::Ads => Some(&mut self.ads),
            MetricFamily::Versions => Some(&mut self.versions),
            MetricFamily::VersionsFirstSeen => Some(&mut self.versions_first_seen),
            MetricFamily::LangPrimary => Some(&mut self.lang_primary),
            MetricFamily::LangSecondary => Some(&mut self.lang_secondary),
            MetricFamily::Widgets => Some(&mut self.widgets),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyMeta {
    /// Server-assigned timestamp of the last write, or null if never set.
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The normalized view of one day's persisted counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub day: String,
    pub totals: DailyTotals,
    pub meta: DailyMeta,
}
