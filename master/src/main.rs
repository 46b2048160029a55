//! xfleet coordinator binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xfleet_auth::TokenAuthority;
use xfleet_master::hub::{self, HeartbeatConfig, Hub};
use xfleet_master::server::{self, AppState};
use xfleet_master::sync::SyncEngine;
use xfleet_store::Store;

const TOKEN_ISSUER: &str = "xfleet-master";
const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// xfleet coordinator: owns the diff log and node registry and serves the
/// fleet over `/ws`.
#[derive(Parser)]
#[command(name = "xfleet-master", version, about)]
struct Cli {
    /// Path of the embedded database file
    #[arg(long, default_value = "data/xfleet.redb")]
    db: PathBuf,

    /// Secret used to sign node tokens
    #[arg(long, env = "XFLEET_JWT_SECRET", default_value = "change-me-in-production")]
    jwt_secret: String,

    /// Listen address for the WebSocket/HTTP server
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Seconds between heartbeat scans
    #[arg(long, default_value_t = 30)]
    heartbeat_scan_secs: u64,

    /// Seconds of silence before a session is considered dead
    #[arg(long, default_value_t = 90)]
    heartbeat_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Some(parent) = cli.db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let store = Arc::new(Store::open(&cli.db).context("opening store")?);
    // Sessions from a previous incarnation are assumed dead.
    store.reset_all_offline().context("resetting node statuses")?;
    info!(db = %cli.db.display(), "store opened, all nodes reset to offline");

    let auth = Arc::new(TokenAuthority::new(
        &cli.jwt_secret,
        TOKEN_ISSUER,
        TOKEN_LIFETIME,
    ));

    let shutdown = CancellationToken::new();

    let (hub, hub_loop) = Hub::new(store.clone());
    tokio::spawn(hub_loop.run(shutdown.clone()));

    let heartbeat = HeartbeatConfig {
        scan_interval: Duration::from_secs(cli.heartbeat_scan_secs),
        timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
    };
    tokio::spawn(hub::run_heartbeat_monitor(
        hub.clone(),
        heartbeat,
        shutdown.clone(),
    ));

    let sync = Arc::new(SyncEngine::new(store.clone(), hub.clone()));
    let app = server::router(AppState {
        store,
        hub,
        sync,
        auth,
    });

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(listen = %cli.listen, "master listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    info!("master stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}
