//! Ingest batch validation.
//!
//! All-or-nothing: the first structural violation anywhere in the batch
//! rejects the whole submission with a specific machine-readable code, before
//! anything touches the store. Validation works on a parsed
//! [`serde_json::Value`] rather than a serde derive so each violation maps to
//! its own code instead of a generic deserialization error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::batch::{BatchItem, IngestBatch, MetricFamily};

/// Upper bound on items per batch. Keeps the ingest transaction's operation
/// count bounded.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 5000;

static DAY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("request body is not a JSON object")]
    InvalidJson,
    #[error("batch_id must be a non-empty string")]
    InvalidBatchId,
    #[error("platform must be a non-empty string")]
    InvalidPlatform,
    #[error("app_version must be a non-empty string")]
    InvalidAppVersion,
    #[error("items must be a non-empty array")]
    ItemsEmpty,
    #[error("batch exceeds the item limit")]
    TooManyItems,
    #[error("item must be an object of valid metric maps")]
    InvalidItem,
    #[error("day must match YYYY-MM-DD")]
    InvalidDay,
    #[error("app_open must be a non-negative integer")]
    InvalidAppOpen,
    #[error("tools must map non-blank keys to non-negative integers")]
    InvalidTools,
    #[error("ads must map non-blank keys to non-negative integers")]
    InvalidAds,
}

impl ValidationError {
    /// Stable code returned on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidJson => "invalid_json",
            ValidationError::InvalidBatchId => "invalid_batch_id",
            ValidationError::InvalidPlatform => "invalid_platform",
            ValidationError::InvalidAppVersion => "invalid_app_version",
            ValidationError::ItemsEmpty => "items_empty",
            ValidationError::TooManyItems => "too_many_items",
            ValidationError::InvalidItem => "invalid_item",
            ValidationError::InvalidDay => "invalid_day",
            ValidationError::InvalidAppOpen => "invalid_app_open",
            ValidationError::InvalidTools => "invalid_tools",
            ValidationError::InvalidAds => "invalid_ads",
        }
    }
}

/// Validate a parsed JSON body into a typed batch.
pub fn parse_batch(body: &Value, max_items: usize) -> Result<IngestBatch, ValidationError> {
    let obj = body.as_object().ok_or(ValidationError::InvalidJson)?;

    let batch_id = required_string(obj.get("batch_id")).ok_or(ValidationError::InvalidBatchId)?;
    let platform = required_string(obj.get("platform")).ok_or(ValidationError::InvalidPlatform)?;
    let app_version =
        required_string(obj.get("app_version")).ok_or(ValidationError::InvalidAppVersion)?;

    let raw_items = obj
        .get("items")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .ok_or(ValidationError::ItemsEmpty)?;
    if raw_items.len() > max_items {
        return Err(ValidationError::TooManyItems);
    }

    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        items.push(parse_item(raw)?);
    }

    Ok(IngestBatch {
        batch_id: batch_id.to_string(),
        platform: platform.to_string(),
        app_version: app_version.to_string(),
        items,
    })
}

fn parse_item(raw: &Value) -> Result<BatchItem, ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::InvalidItem)?;

    let day = obj
        .get("day")
        .and_then(Value::as_str)
        .ok_or(ValidationError::InvalidDay)?;
    if !DAY_PATTERN.is_match(day) {
        return Err(ValidationError::InvalidDay);
    }

    let app_open = match obj.get("app_open") {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_u64().ok_or(ValidationError::InvalidAppOpen)?,
    };

    let mut item = BatchItem {
        day: day.to_string(),
        app_open,
        ..Default::default()
    };

    for family in MetricFamily::MAP_FAMILIES {
        let Some(value) = obj.get(family.as_str()) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let map = parse_family_map(value).ok_or(family_error(family))?;
        if let Some(slot) = item.family_map_mut(family) {
            *slot = map;
        }
    }

    Ok(item)
}

fn family_error(family: MetricFamily) -> ValidationError {
    match family {
        MetricFamily::Tools => ValidationError::InvalidTools,
        MetricFamily::Ads => ValidationError::InvalidAds,
        _ => ValidationError::InvalidItem,
    }
}

/// A metric map is an object of non-blank keys to non-negative integers.
/// `as_u64` rejects negatives, floats and strings in one check.
fn parse_family_map(value: &Value) -> Option<BTreeMap<String, u64>> {
    let obj = value.as_object()?;
    let mut map = BTreeMap::new();
    for (key, count) in obj {
        if key.trim().is_empty() {
            return None;
        }
        map.insert(key.clone(), count.as_u64()?);
    }
    Some(map)
}

fn required_string(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}
