//! HTTP server for tallyd.

use crate::audit::AuditLogger;
use crate::config::TallyConfig;
use crate::routes;
use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{middleware, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tally_common::store::AggregateStore;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers. Requests carry no state of their
/// own; everything durable lives in the store.
pub struct AppState {
    pub store: AggregateStore,
    pub audit: AuditLogger,
    pub config: TallyConfig,
}

impl AppState {
    pub fn new(store: AggregateStore, audit: AuditLogger, config: TallyConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }
}

/// Build the router. Split out of [`run`] so tests can drive it directly.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::ingest_routes())
        .merge(routes::report_routes())
        .with_state(state)
        .layer(middleware::map_response(json_error_envelope))
        .layer(TraceLayer::new_for_http())
}

/// Keep the wire contract JSON-only: axum answers unknown paths and wrong
/// methods with empty bodies, so rewrite those into the error envelope. No
/// handler emits these statuses itself.
async fn json_error_envelope(response: Response) -> Response {
    let code = match response.status() {
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::METHOD_NOT_ALLOWED => "method_not_allowed",
        _ => return response,
    };
    (response.status(), Json(json!({ "ok": false, "error": code }))).into_response()
}

/// Run the HTTP server.
pub async fn run(state: AppState) -> Result<()> {
    let addr = state.config.listen_addr.clone();
    let app = app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("  Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
