//! Playback handlers
//!
//! Resolve a numeric stream id back to its portal channel, lease a MAC,
//! resolve the upstream link, then either redirect the player or remux the
//! bytes through ffmpeg. A resolution failure on one MAC is retried once on
//! another before the player sees an error. The MAC lease and the session
//! slot live exactly as long as the response body.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use futures_util::StreamExt;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::StreamingMode;
use crate::errors::GatewayError;
use crate::models::{DownstreamUser, Portal, StreamKey};
use crate::pool::MacLease;
use crate::portal::PortalClient;
use crate::proxy::Tunnel;
use crate::session::{device_fingerprint, ConnectionGuard};
use crate::web::AppState;

/// ffmpeg `-timeout` is in microseconds.
const FFMPEG_IO_TIMEOUT_US: &str = "10000000";
const TOUCH_INTERVAL: Duration = Duration::from_secs(5);

pub async fn live(
    State(state): State<AppState>,
    Path((username, password, stream)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    serve(state, username, password, stream, headers, Kind::Live).await
}

pub async fn movie(
    State(state): State<AppState>,
    Path((username, password, stream)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    serve(state, username, password, stream, headers, Kind::Movie).await
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Live,
    Movie,
}

async fn serve(
    state: AppState,
    username: String,
    password: String,
    stream: String,
    headers: HeaderMap,
    kind: Kind,
) -> Response {
    let user = match state.broker.authenticate(&username, &password) {
        Ok(user) => user.clone(),
        Err(reason) => {
            debug!(username = %username, %reason, "playback auth rejected");
            return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
        }
    };

    let snapshot = state.catalog.current().await;
    let Some((key, stream_id, cmd)) = lookup(&snapshot, &stream, kind) else {
        let id = stream
            .rsplit_once('.')
            .map(|(s, _)| s)
            .unwrap_or(&stream)
            .parse()
            .unwrap_or_default();
        return error_response(&GatewayError::UnknownStreamId(id));
    };
    if !user.portal_allowed(&key.portal_id) {
        return error_response(&GatewayError::PortalRestricted {
            portal_id: key.portal_id.clone(),
        });
    }
    let Some(portal) = state
        .portals
        .iter()
        .find(|p| p.id == key.portal_id && p.enabled)
    else {
        return (StatusCode::NOT_FOUND, "portal unavailable").into_response();
    };

    let client_ip = client_ip(&headers);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let device = device_fingerprint(&client_ip, user_agent);
    let guard = match state.broker.admit(&user, stream_id, &device, &client_ip) {
        Ok(guard) => guard,
        Err(err) => {
            info!(username = %user.username, error = %err, "admission denied");
            return error_response(&err);
        }
    };

    match resolve_with_retry(&state, portal, &cmd).await {
        Ok((lease, tunnel, link)) => {
            info!(
                username = %user.username,
                stream_id,
                portal = %portal.id,
                mac = %lease.mac(),
                "playback link resolved"
            );
            start_playback(&state, &user, lease, guard, tunnel, link).await
        }
        Err(err) => error_response(&err),
    }
}

/// Downstream-facing mapping of gateway errors; playback paths answer with
/// plain HTTP statuses, never 5xx bodies players would misparse as media.
fn error_response(err: &GatewayError) -> Response {
    let (status, message) = match err {
        GatewayError::NoMacAvailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "no identity available")
        }
        GatewayError::AdmissionDenied { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "max connections reached")
        }
        GatewayError::UnknownStreamId(_) => (StatusCode::NOT_FOUND, "unknown stream"),
        GatewayError::PortalRestricted { .. } => (StatusCode::FORBIDDEN, "portal not allowed"),
        GatewayError::PlaybackUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "playback unavailable")
        }
    };
    (status, message).into_response()
}

/// Map the path segment to a catalog entry. Accepts `1234`, `1234.ts` and
/// the `custom_sid` string form.
fn lookup(
    snapshot: &crate::catalog::CatalogSnapshot,
    stream: &str,
    kind: Kind,
) -> Option<(StreamKey, u32, String)> {
    let bare = stream.rsplit_once('.').map(|(s, _)| s).unwrap_or(stream);
    let key = match bare.parse::<u32>() {
        Ok(id) => snapshot.key_for(id).cloned()?,
        Err(_) => snapshot
            .channels
            .iter()
            .map(|c| &c.key)
            .chain(snapshot.vod_items.iter().map(|v| &v.key))
            .find(|k| k.as_sid() == bare)
            .cloned()?,
    };
    let stream_id = snapshot.stream_id_for(&key)?;
    match kind {
        Kind::Live => {
            let channel = snapshot.channel(&key).filter(|c| c.enabled)?;
            Some((key, stream_id, channel.cmd.clone()))
        }
        Kind::Movie => {
            let item = snapshot.vod_item(&key).filter(|v| v.enabled)?;
            Some((key, stream_id, item.cmd.clone()))
        }
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

/// Lease a MAC and resolve the link; a failed attempt gets one retry on a
/// different MAC before the player sees an error.
async fn resolve_with_retry(
    state: &AppState,
    portal: &Portal,
    cmd: &str,
) -> Result<(MacLease, Arc<Tunnel>, String), GatewayError> {
    let tunnel = match state.tunnels.open(portal.proxy.as_deref()).await {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!(portal = %portal.id, error = %err, "tunnel unavailable for playback");
            return Err(GatewayError::PlaybackUnavailable {
                reason: err.to_string(),
            });
        }
    };

    let mut failed_mac: Option<String> = None;
    for attempt in 0..2 {
        let lease = state
            .pool
            .select_excluding(&portal.id, failed_mac.as_deref())?;
        let client = match PortalClient::new(portal, lease.mac(), Arc::clone(&tunnel)) {
            Ok(client) => client,
            Err(err) => {
                warn!(portal = %portal.id, error = %err, "client build failed");
                return Err(GatewayError::PlaybackUnavailable {
                    reason: err.to_string(),
                });
            }
        };
        match client.resolve_stream_link(cmd).await {
            Ok(link) => {
                if state.config.streaming.test_streams && !probe_stream(state, &link).await {
                    warn!(portal = %portal.id, mac = %lease.mac(), "resolved link failed probe");
                    state.pool.record_failure(&portal.id, lease.mac());
                    failed_mac = Some(lease.mac().to_string());
                    continue;
                }
                state.pool.record_success(&portal.id, lease.mac());
                return Ok((lease, tunnel, link));
            }
            Err(err) => {
                warn!(
                    portal = %portal.id,
                    mac = %lease.mac(),
                    attempt,
                    error = %err,
                    "link resolution failed"
                );
                state.pool.record_failure(&portal.id, lease.mac());
                failed_mac = Some(lease.mac().to_string());
            }
        }
    }
    Err(GatewayError::PlaybackUnavailable {
        reason: "all resolution attempts exhausted".to_string(),
    })
}

/// Quick ffprobe sanity check on the resolved link.
async fn probe_stream(state: &AppState, url: &str) -> bool {
    let result = tokio::time::timeout(
        state.config.probe_timeout(),
        Command::new(&state.config.streaming.ffprobe_path)
            .args(["-v", "error", "-show_entries", "format=format_name", "-of", "json"])
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status(),
    )
    .await;
    matches!(result, Ok(Ok(status)) if status.success())
}

async fn start_playback(
    state: &AppState,
    user: &DownstreamUser,
    lease: MacLease,
    guard: ConnectionGuard,
    tunnel: Arc<Tunnel>,
    link: String,
) -> Response {
    match state.config.streaming.mode {
        StreamingMode::Redirect => {
            // Nothing to meter once the player talks to the upstream
            // directly; the lease and session slot are released here.
            Redirect::temporary(&link).into_response()
        }
        StreamingMode::Remux => remux(state, user, lease, guard, tunnel, link).await,
    }
}

/// Pipe the upstream through `ffmpeg -codec copy`; the child, the MAC
/// lease and the session slot all die with the response body.
async fn remux(
    state: &AppState,
    user: &DownstreamUser,
    lease: MacLease,
    guard: ConnectionGuard,
    tunnel: Arc<Tunnel>,
    link: String,
) -> Response {
    let mut template = state.config.streaming.ffmpeg_command.clone();
    if tunnel.proxy_url().is_none() {
        template = template.replace("-http_proxy <proxy>", "");
    }
    let args: Vec<String> = template
        .split_whitespace()
        .map(|token| match token {
            "<url>" => link.clone(),
            "<proxy>" => tunnel.proxy_url().unwrap_or("").to_string(),
            "<timeout>" => FFMPEG_IO_TIMEOUT_US.to_string(),
            other => other.to_string(),
        })
        .collect();

    let mut child = match Command::new(&state.config.streaming.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(error = %err, "ffmpeg spawn failed");
            return (StatusCode::SERVICE_UNAVAILABLE, "playback unavailable").into_response();
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "playback unavailable").into_response();
    };

    debug!(username = %user.username, mac = %lease.mac(), "remux started");
    let stream = async_stream::stream! {
        let _child = child;
        let guard = guard;
        let lease = lease;
        let mut reader = ReaderStream::new(stdout);
        let mut last_touch = Instant::now();
        while let Some(chunk) = reader.next().await {
            if last_touch.elapsed() >= TOUCH_INTERVAL {
                lease.touch();
                guard.touch();
                last_touch = Instant::now();
            }
            yield chunk;
        }
    };

    (
        [(header::CONTENT_TYPE, "video/mp2t")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSnapshot;
    use crate::models::Channel;

    fn channel(portal: &str, id: &str, enabled: bool) -> Channel {
        Channel {
            key: StreamKey::new(portal, id),
            name: id.into(),
            number: 1,
            genre_id: "1".into(),
            logo: None,
            cmd: format!("ffmpeg http://localhost/ch/{id}"),
            enabled,
            epg_id: None,
        }
    }

    #[test]
    fn lookup_accepts_numeric_id_with_and_without_extension() {
        let snapshot =
            CatalogSnapshot::build(vec![channel("p", "7", true)], vec![], vec![], vec![]);
        let id = snapshot.stream_id_for(&StreamKey::new("p", "7")).unwrap();
        assert!(lookup(&snapshot, &id.to_string(), Kind::Live).is_some());
        assert!(lookup(&snapshot, &format!("{id}.ts"), Kind::Live).is_some());
        assert!(lookup(&snapshot, &format!("{id}.m3u8"), Kind::Live).is_some());
    }

    #[test]
    fn lookup_accepts_the_sid_form_and_rejects_disabled() {
        let snapshot = CatalogSnapshot::build(
            vec![channel("p", "7", true), channel("p", "8", false)],
            vec![],
            vec![],
            vec![],
        );
        assert!(lookup(&snapshot, "p_7", Kind::Live).is_some());
        assert!(lookup(&snapshot, "p_8", Kind::Live).is_none());
        assert!(lookup(&snapshot, "p_9", Kind::Live).is_none());
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.1.2.3");
        assert_eq!(client_ip(&HeaderMap::new()), "0.0.0.0");
    }
}
