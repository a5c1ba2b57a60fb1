//! Agora relay server binary. Wires the relay core to the HTTP/WebSocket
//! front end and runs until interrupted.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use agora_core::logging::init_subscriber;
use agora_relay::backbone::InProcessBackbone;
use agora_relay::RelayHub;
use agora_server::config::ServerConfig;
use agora_server::server::AgoraServer;

/// Agora live-update relay.
#[derive(Parser, Debug)]
#[command(name = "agora-server", about = "Agora live-update relay")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "4600")]
    port: u16,

    /// Maximum concurrent WebSocket connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Endpoint to hand clients off to on shutdown. Without it, shutdown
    /// closes connections instead of migrating them.
    #[arg(long)]
    handoff_endpoint: Option<String>,

    /// Seconds to wait for handoff acknowledgements.
    #[arg(long, default_value = "30")]
    handoff_grace_secs: u64,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);
    let metrics_handle = agora_server::metrics::install_recorder();

    let mut config = ServerConfig {
        host: cli.host,
        port: cli.port,
        handoff_endpoint: cli.handoff_endpoint,
        handoff_grace_secs: cli.handoff_grace_secs,
        ..ServerConfig::default()
    };
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }

    let backbone = Arc::new(InProcessBackbone::new());
    let hub = RelayHub::new(config.hub, backbone);
    hub.start();

    let server = AgoraServer::new(config.clone(), hub.clone(), metrics_handle);
    let (addr, serve_handle) = server.listen().await?;
    info!(%addr, "agora relay ready");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    if let Some(endpoint) = &config.handoff_endpoint {
        let report = hub
            .handoff(endpoint, Duration::from_secs(config.handoff_grace_secs))
            .await;
        info!(acked = report.acked, forced = report.forced, "handoff finished");
    }
    hub.shutdown().await;
    server
        .shutdown()
        .graceful_stop(vec![serve_handle], Duration::from_secs(10))
        .await;
    Ok(())
}
