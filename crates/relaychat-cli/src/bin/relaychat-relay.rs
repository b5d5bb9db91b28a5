//! relaychat relay node
//!
//! Forwards circuits between peers that cannot reach each other directly

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use relaychat_cli::config::{Config, LimitOverrides};
use relaychat_cli::{keyfile, logging};
use relaychat_core::{Host, Identity, Multiaddr, Protocol};
use relaychat_relay::{DEFAULT_RELAY_PORT, RelayService, resolve_with_port};

/// relaychat-relay - circuit relay node for relaychat
#[derive(Parser)]
#[command(name = "relaychat-relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node
    Serve {
        /// Listen address (repeatable)
        #[arg(short, long)]
        listen: Vec<String>,

        /// Maximum concurrent reservations
        #[arg(long)]
        reservations: Option<usize>,

        /// Maximum concurrent circuits
        #[arg(long)]
        circuits: Option<usize>,

        /// Reservation lifetime in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Bytes forwarded per reservation
        #[arg(long)]
        data: Option<u64>,

        /// Admit every peer
        #[arg(long, conflicts_with = "allow")]
        allow_all: bool,

        /// Admit this peer (repeatable)
        #[arg(long)]
        allow: Vec<String>,

        /// Identity key file, created if absent
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Check that a relay node is reachable
    Probe {
        /// IP address of the relay node
        #[arg(long)]
        ip: String,

        /// Peer ID of the relay node
        #[arg(long = "peerid")]
        peer_id: String,

        /// TCP port of the relay node
        #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    logging::init(cli.verbose, &config.logging.level);

    match cli.command {
        Commands::Serve {
            listen,
            reservations,
            circuits,
            duration,
            data,
            allow_all,
            allow,
            key,
        } => {
            let overrides = LimitOverrides {
                max_reservations: reservations,
                max_circuits: circuits,
                reservation_duration_secs: duration,
                max_data_per_reservation: data,
                allow_all,
                allow,
            };
            serve(&config, listen, &overrides, key).await?;
        }
        Commands::Probe { ip, peer_id, port } => {
            probe(&ip, &peer_id, port).await?;
        }
    }

    Ok(())
}

/// Default listen addresses: every IPv4 and IPv6 interface
fn default_listen() -> Vec<String> {
    vec![
        format!("/ip4/0.0.0.0/tcp/{DEFAULT_RELAY_PORT}"),
        format!("/ip6/::/tcp/{DEFAULT_RELAY_PORT}"),
    ]
}

/// Run the relay until interrupted
async fn serve(
    config: &Config,
    listen: Vec<String>,
    overrides: &LimitOverrides,
    key: Option<PathBuf>,
) -> anyhow::Result<()> {
    let limits = config.relay.to_limits(overrides)?;

    let identity = match key.or_else(|| config.relay.key_file.clone()) {
        Some(path) => keyfile::load_or_create(&path)?,
        None => Identity::generate(),
    };
    let host = Host::new(identity);
    let _service = RelayService::new(host.clone(), limits.clone())
        .context("Failed to enable relay service")?;

    let explicit = !listen.is_empty() || !config.relay.listen.is_empty();
    let listen = if !listen.is_empty() {
        listen
    } else if !config.relay.listen.is_empty() {
        config.relay.listen.clone()
    } else {
        default_listen()
    };

    let mut bound = Vec::new();
    for addr in &listen {
        let addr: Multiaddr = addr
            .parse()
            .with_context(|| format!("Invalid listen address: {addr}"))?;
        match host.listen(&addr).await {
            Ok(actual) => bound.push(actual),
            // Hosts without IPv6 still serve IPv4 on the default pair
            Err(e) if !explicit => tracing::warn!(%addr, error = %e, "listen failed"),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to listen on {addr}")));
            }
        }
    }
    if bound.is_empty() {
        anyhow::bail!("Relay could not bind any listen address");
    }

    tracing::info!(
        reservations = limits.max_reservations,
        circuits = limits.max_circuits,
        duration = ?limits.reservation_duration,
        data = limits.max_data_per_reservation,
        "relay limits"
    );

    let peer_id = host.peer_id();
    println!("Relay node is running. Peer ID: {peer_id}");
    for addr in bound {
        println!("Listening on: {}", addr.with(Protocol::P2p(peer_id)));
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    host.shutdown();

    Ok(())
}

/// Connect to a relay and report success
async fn probe(ip: &str, peer_id: &str, port: u16) -> anyhow::Result<()> {
    let relay = resolve_with_port(ip, peer_id, port).context("Invalid relay address")?;
    let host = Host::new(Identity::generate());

    host.connect(relay.address())
        .await
        .context("Failed to connect to relay node")?;
    println!("Connected to relay node");

    Ok(())
}
