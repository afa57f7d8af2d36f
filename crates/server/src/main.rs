// direktiv binary
// Decision: DIREKTIV_APP picks the role; flow is the default
// Decision: The bus daemon and its admin ports are served before the node starts so peers can reach it

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use direktiv_cluster::{
    http::{admin_router, daemon_router}, http_ready, Bus, BusConfig, DnsFinder, HttpTransport, PeerFinder,
    StaticFinder, READY_TIMEOUT,
};
use direktiv_core::telemetry::{init_telemetry, TelemetryConfig};
use direktiv_core::{AppKind, Config};
use direktiv_reconciler::runtime_from_config;
use direktiv_server::{router, Node};
use direktiv_sidecar::SidecarConfig;
use direktiv_storage::{SecretCipher, SizeLimit, Storage};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const BUS_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(
        TelemetryConfig::from_env().with_default_filter("direktiv=info,tower_http=info"),
    );

    let config = Config::from_env().context("invalid configuration")?;
    info!(app = ?config.app, version = env!("CARGO_PKG_VERSION"), "direktiv starting");

    match config.app {
        AppKind::Sidecar => {
            direktiv_sidecar::serve(SidecarConfig::from_config(&config), ctrl_c())
                .await
                .context("sidecar server failed")?;
        }
        AppKind::Init => {
            let copied = direktiv_sidecar::install(Path::new(&config.init_target))
                .await
                .context("installing the command executor failed")?;
            info!(target = %config.init_target, bytes = copied, "command executor installed");
        }
        AppKind::Flow => run_flow(config).await?,
    }
    Ok(())
}

async fn run_flow(config: Config) -> Result<()> {
    let cipher = SecretCipher::from_config(config.secrets_key.as_deref())
        .context("invalid secrets key")?;
    let storage = Storage::connect(
        config.database_url.as_deref(),
        cipher,
        SizeLimit::new(config.max_variable_size),
    )
    .await
    .context("failed to open storage")?;
    if config.database_url.is_none() {
        info!("no DATABASE_URL, using in-memory storage");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus = build_bus(&config)?;
    serve(config.bus_ports.daemon, daemon_router(bus.clone()), shutdown_rx.clone()).await?;
    serve(config.bus_ports.daemon_admin, admin_router(bus.clone()), shutdown_rx.clone()).await?;
    serve(config.bus_ports.lookup_admin, admin_router(bus.clone()), shutdown_rx.clone()).await?;
    let client = reqwest::Client::new();
    http_ready(
        &client,
        &format!("127.0.0.1:{}", config.bus_ports.daemon_admin),
        READY_TIMEOUT,
    )
    .await
    .context("bus daemon did not become ready")?;
    bus.start();

    let runtime = runtime_from_config(&config);
    let api_port = config.api_port;
    let node = Node::build(config, storage, Some(bus), runtime)?;
    node.start().await?;

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], api_port)))
        .await
        .with_context(|| format!("failed to bind api port {api_port}"))?;
    info!(port = api_port, "api listening");
    axum::serve(listener, router(node.clone()))
        .with_graceful_shutdown(ctrl_c())
        .await
        .context("api server failed")?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    node.shutdown().await;
    Ok(())
}

fn build_bus(config: &Config) -> Result<Bus> {
    let host = std::env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
    let address = format!("{host}:{}", config.bus_ports.daemon);
    let finder: Arc<dyn PeerFinder> = match &config.bus_service {
        Some(service) => Arc::new(DnsFinder::new(service.clone(), config.bus_ports.daemon)),
        None => Arc::new(StaticFinder::new(config.bus_peers.clone())),
    };
    let transport = HttpTransport::new(BUS_TIMEOUT).context("bus transport")?;
    Ok(Bus::new(
        BusConfig::new(config.pod_name.clone(), address),
        Arc::new(transport),
        finder,
    ))
}

/// Serve a router on a port in the background until shutdown flips
async fn serve(port: u16, app: Router, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tokio::spawn(async move {
        let stop = async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
            error!(port, error = %e, "bus listener failed");
        }
    });
    Ok(())
}

fn ctrl_c() -> impl Future<Output = ()> + Send + 'static {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }
}
