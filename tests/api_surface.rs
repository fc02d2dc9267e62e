//! HTTP surface tests: auth shapes, catalog listings and admission
//! behavior, served entirely from a prepared snapshot.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::Value;

use stalker_gateway::catalog::{CatalogSnapshot, CatalogStore};
use stalker_gateway::config::Config;
use stalker_gateway::epg::EpgStore;
use stalker_gateway::jobs::ProgressTracker;
use stalker_gateway::models::{
    Category, CategoryKind, Channel, DownstreamUser, Portal, StreamKey,
};
use stalker_gateway::pool::MacPoolManager;
use stalker_gateway::proxy::TunnelFactory;
use stalker_gateway::session::SessionBroker;
use stalker_gateway::web::{router, AppState};

fn channel(portal: &str, id: &str, name: &str, number: u32, genre: &str) -> Channel {
    Channel {
        key: StreamKey::new(portal, id),
        name: name.into(),
        number,
        genre_id: genre.into(),
        logo: Some(format!("http://logo.example/{id}.png")),
        cmd: format!("ffmpeg http://localhost/ch/{id}"),
        enabled: true,
        epg_id: None,
    }
}

fn portal(id: &str) -> Portal {
    Portal {
        id: id.into(),
        name: id.to_uppercase(),
        url: "http://portal.example".into(),
        enabled: true,
        proxy: None,
        streams_per_mac: 1,
        epg_offset_hours: 0,
        macs: vec!["00:1A:79:00:00:01".into()],
        enabled_channels: Default::default(),
        custom_names: Default::default(),
        custom_numbers: Default::default(),
        custom_genres: Default::default(),
        custom_epg_ids: Default::default(),
    }
}

fn user(username: &str, max: u32, allowed: Vec<String>) -> DownstreamUser {
    DownstreamUser {
        username: username.into(),
        password: "secret".into(),
        enabled: true,
        max_connections: max,
        allowed_portals: allowed,
        expires_at: None,
        created_at: None,
    }
}

async fn test_state(users: Vec<DownstreamUser>) -> AppState {
    let portals = vec![portal("hb"), portal("astra")];
    let snapshot = CatalogSnapshot::build(
        vec![
            channel("hb", "1", "News One", 1, "5"),
            channel("hb", "2", "Sports Two", 2, "6"),
            channel("astra", "1", "Astra One", 3, "5"),
        ],
        vec![
            Category {
                id: "hb_5".into(),
                name: "HB - News".into(),
                kind: CategoryKind::Live,
                portal_id: "hb".into(),
            },
            Category {
                id: "hb_6".into(),
                name: "HB - Sports".into(),
                kind: CategoryKind::Live,
                portal_id: "hb".into(),
            },
            Category {
                id: "astra_5".into(),
                name: "ASTRA - News".into(),
                kind: CategoryKind::Live,
                portal_id: "astra".into(),
            },
        ],
        vec![],
        vec![],
    );
    let catalog = Arc::new(CatalogStore::new());
    catalog.replace(snapshot).await;

    let config = Arc::new(Config::default());
    AppState {
        pool: Arc::new(MacPoolManager::new(
            &portals,
            &config.pool,
            config.mac_cooldown(),
        )),
        broker: Arc::new(SessionBroker::new(users, config.liveness_timeout())),
        tunnels: Arc::new(TunnelFactory::new(config.tunnel.clone())),
        progress: Arc::new(ProgressTracker::new()),
        portals: Arc::new(portals),
        epg: Arc::new(EpgStore::new()),
        catalog,
        config,
    }
}

#[tokio::test]
async fn bad_credentials_get_the_negative_auth_shape_not_an_error() {
    let state = test_state(vec![user("alice", 1, vec![])]).await;
    let server = TestServer::new(router(state)).unwrap();
    let response = server
        .get("/player_api.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "wrong")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["user_info"]["auth"], 0);
}

#[tokio::test]
async fn login_without_action_returns_user_and_server_info() {
    let state = test_state(vec![user("alice", 2, vec![])]).await;
    let server = TestServer::new(router(state)).unwrap();
    let response = server
        .get("/player_api.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "secret")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["user_info"]["auth"], 1);
    assert_eq!(body["user_info"]["max_connections"], "2");
    assert_eq!(body["server_info"]["server_protocol"], "http");
}

#[tokio::test]
async fn live_streams_are_filtered_by_category_and_portal_restriction() {
    let state = test_state(vec![
        user("alice", 1, vec![]),
        user("bob", 1, vec!["astra".into()]),
    ])
    .await;
    let server = TestServer::new(router(state)).unwrap();

    let all: Vec<Value> = server
        .get("/player_api.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "secret")
        .add_query_param("action", "get_live_streams")
        .await
        .json();
    assert_eq!(all.len(), 3);

    let news_only: Vec<Value> = server
        .get("/player_api.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "secret")
        .add_query_param("action", "get_live_streams")
        .add_query_param("category_id", "hb_5")
        .await
        .json();
    assert_eq!(news_only.len(), 1);
    assert_eq!(news_only[0]["name"], "News One");
    assert_eq!(news_only[0]["category_id"], "hb_5");

    let restricted: Vec<Value> = server
        .get("/player_api.php")
        .add_query_param("username", "bob")
        .add_query_param("password", "secret")
        .add_query_param("action", "get_live_streams")
        .await
        .json();
    assert_eq!(restricted.len(), 1);
    assert_eq!(restricted[0]["name"], "Astra One");

    let categories: Vec<Value> = server
        .get("/player_api.php")
        .add_query_param("username", "bob")
        .add_query_param("password", "secret")
        .add_query_param("action", "get_live_categories")
        .await
        .json();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0]["category_id"], "astra_5");
}

#[tokio::test]
async fn playlist_lists_channels_in_number_order() {
    let state = test_state(vec![user("alice", 1, vec![])]).await;
    let server = TestServer::new(router(state)).unwrap();
    let response = server
        .get("/get.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "secret")
        .await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.starts_with("#EXTM3U"));
    let news = body.find("News One").unwrap();
    let sports = body.find("Sports Two").unwrap();
    let astra = body.find("Astra One").unwrap();
    assert!(news < sports && sports < astra);
    assert!(body.contains("group-title=\"HB - News\""));
    assert!(body.contains("/live/alice/secret/"));
}

#[tokio::test]
async fn xmltv_requires_credentials_and_lists_channels() {
    let state = test_state(vec![user("alice", 1, vec![])]).await;
    let server = TestServer::new(router(state)).unwrap();

    let denied = server.get("/xmltv.php").await;
    denied.assert_status_unauthorized();

    let response = server
        .get("/xmltv.php")
        .add_query_param("username", "alice")
        .add_query_param("password", "secret")
        .await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("<tv "));
    assert!(body.contains("News One"));
}

#[tokio::test]
async fn playback_of_an_unknown_stream_is_a_404() {
    let state = test_state(vec![user("alice", 1, vec![])]).await;
    let server = TestServer::new(router(state)).unwrap();
    let response = server.get("/live/alice/secret/999.ts").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn admission_limit_rejects_the_second_device() {
    let state = test_state(vec![user("alice", 1, vec![])]).await;
    let broker = Arc::clone(&state.broker);
    let user = broker.user("alice").unwrap().clone();
    // First device is already streaming.
    let _held = broker.admit(&user, 100, "device-a", "10.0.0.1").unwrap();

    let server = TestServer::new(router(state.clone())).unwrap();
    let snapshot = state.catalog.current().await;
    let stream_id = snapshot
        .stream_id_for(&StreamKey::new("hb", "1"))
        .unwrap();
    let response = server
        .get(&format!("/live/alice/secret/{stream_id}.ts"))
        .add_header("x-forwarded-for", "10.0.0.2")
        .add_header("user-agent", "VLC/3.0.20")
        .await;
    response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
}
