//! API routes for tallyd.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use tally_common::batch::DailyAggregate;
use tally_common::report::{self, SummaryReport, DEFAULT_WINDOW_DAYS};
use tally_common::store::{parse_range, RangeError};
use tally_common::validate::parse_batch;

use crate::error::ApiError;
use crate::ingest;
use crate::server::AppState;

type AppStateArc = Arc<AppState>;

pub fn ingest_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/ingest", post(ingest_batch))
}

pub fn report_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/days", get(range_export))
        .route("/v1/summary", get(rolling_summary))
}

// ============================================================================
// Auth
// ============================================================================

enum KeyScope {
    Write,
    /// Read endpoints accept the read key or the write key.
    Read,
}

fn authorize(state: &AppState, headers: &HeaderMap, scope: KeyScope) -> Result<(), ApiError> {
    let presented = presented_key(headers).ok_or(ApiError::Unauthorized)?;
    let accepted: &[&str] = match scope {
        KeyScope::Write => &[state.config.write_key.as_str()],
        KeyScope::Read => &[
            state.config.read_key.as_str(),
            state.config.write_key.as_str(),
        ],
    };
    if accepted.iter().any(|key| !key.is_empty() && *key == presented) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// ============================================================================
// Ingest
// ============================================================================

async fn ingest_batch(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers, KeyScope::Write)?;

    let value: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("invalid_json"))?;
    let batch = parse_batch(&value, state.config.max_batch_items)
        .map_err(|e| ApiError::BadRequest(e.code()))?;

    ingest::process_batch(&state.store, &state.audit, &batch)
        .await
        .map_err(|e| {
            error!(
                batch_id = %batch.batch_id,
                platform = %batch.platform,
                app_version = %batch.app_version,
                "ingest failed: {e:#}"
            );
            ApiError::Internal(e)
        })?;

    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// Reporting
// ============================================================================

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: Option<String>,
    to: Option<String>,
}

async fn range_export(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<DailyAggregate>>, ApiError> {
    authorize(&state, &headers, KeyScope::Read)?;

    let from = params
        .from
        .as_deref()
        .ok_or(ApiError::BadRequest("invalid_range"))?;
    let to = params
        .to
        .as_deref()
        .ok_or(ApiError::BadRequest("invalid_range"))?;
    let range = parse_range(from, to).map_err(range_code)?;

    let days = state.store.fetch_range(&range).map_err(|e| {
        error!(from = %from, to = %to, "range export failed: {e:#}");
        ApiError::Internal(e)
    })?;

    Ok(Json(days))
}

#[derive(Debug, Deserialize)]
struct SummaryParams {
    last: Option<String>,
    tz: Option<String>,
}

async fn rolling_summary(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Query(params): Query<SummaryParams>,
) -> Result<Json<SummaryReport>, ApiError> {
    authorize(&state, &headers, KeyScope::Read)?;

    let window = match params.last.as_deref() {
        None => DEFAULT_WINDOW_DAYS,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::BadRequest("invalid_last"))?,
    };
    let window = report::clamp_window(window);
    let tz = resolve_timezone(&state.config.default_tz, params.tz.as_deref())?;

    let (from, to) = report::window_ending_today(tz, window);
    // Always valid by construction: the window is clamped to the range cap.
    let range = parse_range(
        &from.format("%Y-%m-%d").to_string(),
        &to.format("%Y-%m-%d").to_string(),
    )
    .map_err(range_code)?;

    let days = state.store.fetch_range(&range).map_err(|e| {
        error!(days = window, tz = %tz, "summary failed: {e:#}");
        ApiError::Internal(e)
    })?;

    Ok(Json(report::summarize(&range, &days)))
}

fn range_code(err: RangeError) -> ApiError {
    match err {
        RangeError::Invalid => ApiError::BadRequest("invalid_range"),
        RangeError::TooLarge => ApiError::BadRequest("range_too_large"),
    }
}

fn resolve_timezone(config_tz: &str, query_tz: Option<&str>) -> Result<chrono_tz::Tz, ApiError> {
    if let Some(name) = query_tz {
        return name.parse().map_err(|_| ApiError::BadRequest("invalid_tz"));
    }
    // A broken configured zone falls back rather than breaking every summary.
    Ok(config_tz.parse().unwrap_or(chrono_tz::Europe::Madrid))
}
