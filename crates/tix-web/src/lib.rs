//! Read-only JSON API over the public store credential.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tix_core::GENERAL_ADMISSION;
use tix_storage::{PgStore, ReadStore, StoreError};
use tix_sync::{require_env, READ_DATABASE_URL_ENV};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tix-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestQuery {
    pub ticket_type: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(events_handler))
        .route("/api/events/{slug}/snapshots", get(snapshots_handler))
        .route("/api/latest", get(latest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let database_url = require_env(READ_DATABASE_URL_ENV)?;
    let port: u16 = std::env::var("TIX_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let store = PgStore::connect(&database_url)
        .await
        .context("connecting to the read database")?;
    let state = AppState::new(Arc::new(store));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn events_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.events_by_date().await {
        Ok(events) => Json(events).into_response(),
        Err(err) => load_failed("events", err),
    }
}

async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    match state.store.snapshots_for_event(&slug, query.since).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => load_failed("snapshots", err),
    }
}

async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> Response {
    let ticket_type = query
        .ticket_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| GENERAL_ADMISSION.to_string());
    match state.store.latest_snapshots(&ticket_type).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => load_failed("latest snapshots", err),
    }
}

fn load_failed(what: &str, err: StoreError) -> Response {
    error!(what, error = %err, "read failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "failed to load" })),
    )
        .into_response()
}
