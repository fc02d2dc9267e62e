//! Web layer
//!
//! The Xtream-Codes-compatible surface for players plus a small status
//! surface for operators. Handlers are thin: auth and admission live in
//! the session broker, catalog answers come from the current snapshot, and
//! only the playback path ever reaches upstream.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::epg::EpgStore;
use crate::jobs::ProgressTracker;
use crate::models::Portal;
use crate::pool::MacPoolManager;
use crate::proxy::TunnelFactory;
use crate::session::SessionBroker;

pub mod playback;
pub mod responses;
pub mod status;
pub mod xtream;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub portals: Arc<Vec<Portal>>,
    pub catalog: Arc<CatalogStore>,
    pub epg: Arc<EpgStore>,
    pub pool: Arc<MacPoolManager>,
    pub broker: Arc<SessionBroker>,
    pub tunnels: Arc<TunnelFactory>,
    pub progress: Arc<ProgressTracker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/player_api.php",
            get(xtream::player_api).post(xtream::player_api),
        )
        .route("/get.php", get(xtream::playlist))
        .route("/xmltv.php", get(xtream::xmltv))
        .route("/live/{username}/{password}/{stream}", get(playback::live))
        .route(
            "/movie/{username}/{password}/{stream}",
            get(playback::movie),
        )
        .route("/{username}/{password}/{stream}", get(playback::live))
        .route("/health", get(status::health))
        .route("/status/refresh", get(status::refresh_progress))
        .route("/status/macs", get(status::mac_statuses))
        .route("/status/connections", get(status::connections))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
