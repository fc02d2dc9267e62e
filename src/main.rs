use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stalker_gateway::{
    catalog::CatalogStore,
    config::Config,
    epg::EpgStore,
    jobs::{spawn_background_jobs, ProgressTracker, RefreshService},
    pool::MacPoolManager,
    proxy::TunnelFactory,
    session::SessionBroker,
    web::{router, AppState},
};

#[derive(Parser)]
#[command(name = "stalker-gateway")]
#[command(version)]
#[command(about = "Xtream-Codes-compatible gateway for legacy Stalker/MAC portals")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("stalker_gateway={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting stalker-gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    info!("configuration loaded from {}", cli.config);

    let config = Arc::new(config);
    let portals = config.resolve_portals();
    let users = config.resolve_users();
    info!(
        portals = portals.len(),
        users = users.len(),
        "gateway configured"
    );

    let catalog = Arc::new(CatalogStore::new());
    let epg = Arc::new(EpgStore::new());
    let pool = Arc::new(MacPoolManager::new(
        &portals,
        &config.pool,
        config.mac_cooldown(),
    ));
    let broker = Arc::new(SessionBroker::new(users, config.liveness_timeout()));
    let tunnels = Arc::new(TunnelFactory::new(config.tunnel.clone()));
    let progress = Arc::new(ProgressTracker::new());

    let refresh = Arc::new(RefreshService::new(
        Arc::clone(&config),
        portals.clone(),
        Arc::clone(&catalog),
        Arc::clone(&epg),
        Arc::clone(&pool),
        Arc::clone(&tunnels),
        Arc::clone(&progress),
    ));

    // First pass inline so the API never serves an empty catalog longer
    // than it has to; the periodic loops take over afterwards.
    {
        let refresh = Arc::clone(&refresh);
        tokio::spawn(async move {
            refresh.refresh_catalog().await;
            refresh.refresh_epg().await;
        });
    }
    let _jobs = spawn_background_jobs(
        Arc::clone(&config),
        Arc::clone(&refresh),
        Arc::clone(&pool),
        Arc::clone(&broker),
    );

    let state = AppState {
        config: Arc::clone(&config),
        portals: Arc::new(portals),
        catalog,
        epg,
        pool,
        broker,
        tunnels,
        progress,
    };
    let app = router(state);

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
