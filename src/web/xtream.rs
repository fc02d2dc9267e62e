//! Xtream-Codes query surface
//!
//! `player_api.php`, the M3U playlist (`get.php`) and the XMLTV guide
//! (`xmltv.php`). Everything here is answered from the current catalog and
//! guide snapshots plus the user's portal restriction; no handler ever
//! talks to an upstream portal.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::epg::render_xmltv;
use crate::models::{CategoryKind, DownstreamUser};
use crate::web::responses::{
    auth_failed, user_and_server_info, XcCategory, XcLiveStream, XcSeries, XcVodStream,
};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct PlayerApiQuery {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub action: Option<String>,
    pub category_id: Option<String>,
}

pub async fn player_api(
    State(state): State<AppState>,
    Query(query): Query<PlayerApiQuery>,
) -> Json<Value> {
    let user = match state.broker.authenticate(&query.username, &query.password) {
        Ok(user) => user.clone(),
        Err(reason) => {
            debug!(username = %query.username, %reason, "player_api auth rejected");
            return Json(auth_failed(&query.username));
        }
    };

    let snapshot = state.catalog.current().await;
    let body = match query.action.as_deref().unwrap_or("") {
        "" => {
            let active = state.broker.active_count(&user.username);
            user_and_server_info(&state.config, &user, &query.password, active)
        }
        "get_live_categories" => categories(&snapshot, &user, CategoryKind::Live),
        "get_vod_categories" => categories(&snapshot, &user, CategoryKind::Vod),
        "get_series_categories" => categories(&snapshot, &user, CategoryKind::Series),
        "get_live_streams" => {
            let mut channels: Vec<&crate::models::Channel> = snapshot
                .enabled_channels()
                .filter(|c| user.portal_allowed(&c.key.portal_id))
                .filter(|c| {
                    query
                        .category_id
                        .as_deref()
                        .is_none_or(|want| c.category_id() == want)
                })
                .collect();
            channels.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.name.cmp(&b.name)));
            let streams: Vec<XcLiveStream> = channels
                .iter()
                .filter_map(|c| {
                    snapshot
                        .stream_id_for(&c.key)
                        .map(|id| XcLiveStream::new(c, id))
                })
                .collect();
            json!(streams)
        }
        "get_vod_streams" => {
            let streams: Vec<XcVodStream> = snapshot
                .vod_items
                .iter()
                .filter(|v| v.enabled && user.portal_allowed(&v.key.portal_id))
                .filter(|v| {
                    query
                        .category_id
                        .as_deref()
                        .is_none_or(|want| v.category_id == want)
                })
                .enumerate()
                .filter_map(|(i, v)| {
                    snapshot
                        .stream_id_for(&v.key)
                        .map(|id| XcVodStream::new(v, id, i as u32 + 1))
                })
                .collect();
            json!(streams)
        }
        "get_series" => {
            let series: Vec<XcSeries> = snapshot
                .series
                .iter()
                .filter(|s| s.enabled && user.portal_allowed(&s.key.portal_id))
                .filter(|s| {
                    query
                        .category_id
                        .as_deref()
                        .is_none_or(|want| s.category_id == want)
                })
                .enumerate()
                .filter_map(|(i, s)| {
                    snapshot
                        .stream_id_for(&s.key)
                        .map(|id| XcSeries::new(s, id, i as u32 + 1))
                })
                .collect();
            json!(series)
        }
        // Short-form EPG is served empty; players fall back to xmltv.php.
        "get_short_epg" | "get_simple_data_table" => json!({ "epg_listings": [] }),
        other => {
            debug!(action = %other, "unknown player_api action");
            json!([])
        }
    };
    Json(body)
}

fn categories(
    snapshot: &crate::catalog::CatalogSnapshot,
    user: &DownstreamUser,
    kind: CategoryKind,
) -> Value {
    let list: Vec<XcCategory> = snapshot
        .categories
        .iter()
        .filter(|c| c.kind == kind && user.portal_allowed(&c.portal_id))
        .map(XcCategory::from)
        .collect();
    json!(list)
}

#[derive(Debug, Deserialize)]
pub struct PlaylistQuery {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// `get.php`: the standard M3U playlist, channel-number ordered.
pub async fn playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PlaylistQuery>,
) -> Response {
    let user = match state.broker.authenticate(&query.username, &query.password) {
        Ok(user) => user.clone(),
        Err(_) => return (StatusCode::UNAUTHORIZED, "authentication failed").into_response(),
    };

    let snapshot = state.catalog.current().await;
    let base = base_url(&state, &headers);
    let category_names: std::collections::HashMap<&str, &str> = snapshot
        .categories
        .iter()
        .map(|c| (c.id.as_str(), c.name.as_str()))
        .collect();

    let mut channels: Vec<&crate::models::Channel> = snapshot
        .enabled_channels()
        .filter(|c| user.portal_allowed(&c.key.portal_id))
        .collect();
    channels.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.name.cmp(&b.name)));

    let mut out = String::from("#EXTM3U\n");
    for channel in channels {
        let Some(stream_id) = snapshot.stream_id_for(&channel.key) else {
            continue;
        };
        let group = category_names
            .get(channel.category_id().as_str())
            .copied()
            .unwrap_or("");
        out.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{stream_id}\" tvg-name=\"{name}\" tvg-logo=\"{logo}\" group-title=\"{group}\",{name}\n",
            name = channel.name,
            logo = channel.logo.as_deref().unwrap_or(""),
        ));
        out.push_str(&format!(
            "{base}/live/{}/{}/{stream_id}.ts\n",
            query.username, query.password
        ));
    }

    (
        [(header::CONTENT_TYPE, "audio/x-mpegurl")],
        out,
    )
        .into_response()
}

/// `xmltv.php`: the merged guide for every channel the user can see.
pub async fn xmltv(
    State(state): State<AppState>,
    Query(query): Query<PlaylistQuery>,
) -> Response {
    if state
        .broker
        .authenticate(&query.username, &query.password)
        .is_err()
    {
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }
    let catalog = state.catalog.current().await;
    let epg = state.epg.current().await;
    let xml = render_xmltv(&catalog, &epg);
    ([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}

/// Externally visible base URL: configured value, else the Host header.
pub fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.web.base_url {
        return base.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}
