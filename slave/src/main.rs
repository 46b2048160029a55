//! xfleet node agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xfleet_slave::client::MasterClient;
use xfleet_slave::handlers::SlaveAgent;
use xfleet_slave::version::VersionStore;
use xfleet_slave::xray::{config, ConfigManager, TrafficSampler, XrayInstance};

/// xfleet node agent: keeps the local xray process in sync with the master
/// and reports traffic back.
#[derive(Parser)]
#[command(name = "xfleet-slave", version, about)]
struct Cli {
    /// Initial xray configuration file (a built-in default is used when
    /// the file does not exist)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Master WebSocket URL
    #[arg(long, default_value = "ws://localhost:8080/ws")]
    master: String,

    /// Node token issued by the master
    #[arg(long, env = "XFLEET_TOKEN")]
    token: String,

    /// Path of the applied-version file
    #[arg(long, default_value = "data/version.json")]
    version_file: PathBuf,

    /// xray executable
    #[arg(long, default_value = "xray")]
    xray_path: PathBuf,

    /// Port of the injected administrative API ingress
    #[arg(long, default_value_t = 10085)]
    api_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let version = Arc::new(VersionStore::open(&cli.version_file).context("opening version store")?);
    info!(version = version.current(), "applied version loaded");

    let instance = Arc::new(XrayInstance::new(&cli.xray_path, cli.api_port));

    let raw_config = if cli.config.exists() {
        info!(config = %cli.config.display(), "loading xray configuration");
        config::load_from_file(&cli.config).context("reading configuration")?
    } else {
        info!("configuration file absent, using built-in default");
        config::default_config()
    };
    config::validate(&raw_config).context("validating configuration")?;

    instance
        .load_config(&raw_config)
        .await
        .context("loading configuration into xray")?;
    instance.start().await.context("starting xray")?;

    let manager = Arc::new(ConfigManager::new(instance.clone()));
    manager
        .load_initial(&raw_config)
        .await
        .context("initializing config projector")?;

    let shutdown = CancellationToken::new();
    let client = MasterClient::new(&cli.master, &cli.token, shutdown.clone());
    let agent = Arc::new(SlaveAgent::new(
        client.clone(),
        manager.clone(),
        version.clone(),
        instance.clone(),
    ));
    client.set_handler(agent);

    // The post-connect sequence (report_ip, xray_status, sync_request)
    // runs from the handler's on_connected hook.
    client.connect().await.context("connecting to master")?;

    let (report_tx, mut report_rx) = mpsc::channel(8);
    let sampler = TrafficSampler::new(instance.clone(), manager.clone());
    tokio::spawn(sampler.run(report_tx, shutdown.clone()));

    let report_client = client.clone();
    tokio::spawn(async move {
        while let Some(window) = report_rx.recv().await {
            let ingresses = window.len();
            match report_client.send_traffic_report(window).await {
                Ok(()) => info!(ingresses, "traffic report sent"),
                Err(err) => warn!(%err, "failed to send traffic report, window dropped"),
            }
        }
    });

    info!("slave agent running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;

    info!("shutting down");
    shutdown.cancel();
    instance.stop().await;
    info!("slave agent stopped");
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
