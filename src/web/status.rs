//! Operational status surface
//!
//! Polled, not pushed: health, refresh progress, MAC pool state and the
//! active downstream sessions.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::web::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let catalog = state.catalog.current().await;
    let epg = state.epg.current().await;
    Json(json!({
        "status": "ok",
        "channels": catalog.channels.len(),
        "vod_items": catalog.vod_items.len(),
        "series": catalog.series.len(),
        "epg_channels": epg.channel_count(),
        "catalog_generated_at": catalog.generated_at,
    }))
}

pub async fn refresh_progress(State(state): State<AppState>) -> Json<Value> {
    match state.progress.snapshot() {
        Some(progress) => Json(json!(progress)),
        None => Json(json!({ "status": "never run" })),
    }
}

pub async fn mac_statuses(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.pool.statuses()))
}

pub async fn connections(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.broker.connections()))
}
