//! Accord peer.
//!
//! Run a sensor and a monitor:
//!   accord-peer --name sensor --listen 127.0.0.1:9001 --role sensor
//!   accord-peer --name monitor --listen 127.0.0.1:9002 --role monitor --peer ws://127.0.0.1:9001

use accord_interaction::InteractionNode;
use accord_peer::{PeerConfig, Role, WsTransport, telemetry};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "accord-peer", about = "Accord endpoint over WebSocket")]
struct Cli {
    /// Configuration file; missing means defaults
    #[arg(long, env = "ACCORD_CONFIG", default_value = "accord.toml")]
    config: PathBuf,

    #[arg(long, env = "ACCORD_NAME")]
    name: Option<String>,

    /// Address to accept connections on
    #[arg(long, env = "ACCORD_LISTEN")]
    listen: Option<SocketAddr>,

    /// Peer URL to dial (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    #[arg(long, value_enum)]
    role: Option<Role>,
}

impl Cli {
    fn apply(self, mut config: PeerConfig) -> PeerConfig {
        if let Some(name) = self.name {
            config.name = name;
        }
        if self.listen.is_some() {
            config.listen = self.listen;
        }
        config.peers.extend(self.peers);
        if let Some(role) = self.role {
            config.role = role;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("accord=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PeerConfig::load(&cli.config)?;
    let config = cli.apply(config);

    let local = config.endpoint_id();
    tracing::info!("Starting {} as {} ({:?})", config.name, local, config.role);

    let gauge = Arc::new(telemetry::Gauge::default());
    let (transport, events) = WsTransport::new(local);
    let node = InteractionNode::builder(transport.clone())
        .catalog(telemetry::catalog(config.role)?)
        .registry(telemetry::registry(config.role, gauge.clone())?)
        .config(config.node.clone())
        .build();
    node.spawn(events);

    if let Some(addr) = config.listen {
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.listen(addr).await {
                tracing::error!("Listener on {} failed: {}", addr, e);
            }
        });
    }
    for url in &config.peers {
        tokio::spawn(transport.clone().dial(url.clone(), config.redial_delay()));
    }

    if config.role.requires() {
        tokio::spawn(telemetry::monitor(node.clone()));
    }
    if let (true, Some(interval)) = (config.role.provides(), config.alarm_interval()) {
        tokio::spawn(telemetry::raise_alarms(node.clone(), gauge, interval));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down with {} connected endpoints", transport.connected().len());
    Ok(())
}
