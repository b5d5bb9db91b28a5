//! relaychat
//!
//! Peer-to-peer text chat between firewalled peers via a circuit relay

use anyhow::Context;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use relaychat_chat::{
    CHAT_PROTOCOL, ChatSession, EndReason, SessionInput, SessionOutput, StreamHandler,
};
use relaychat_cli::config::Config;
use relaychat_cli::stdin::SharedStdin;
use relaychat_cli::{connect_command, logging};
use relaychat_core::{Host, Identity, Multiaddr, PeerId};
use relaychat_relay::{CircuitDialer, RelayDescriptor, ReservationClient, resolve_with_port};

/// relaychat - chat with a peer through a circuit relay
///
/// Without `-d` the program listens: it reserves a slot on the relay and
/// prints the command a peer runs to reach it. With `-d` it dials that
/// address and starts chatting.
#[derive(Parser)]
#[command(name = "relaychat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local TCP port to listen on
    #[arg(
        short,
        long,
        value_parser = clap::value_parser!(u16).range(1..),
        required_unless_present = "destination"
    )]
    port: Option<u16>,

    /// Destination address (`<relay>/p2p-circuit/p2p/<peer id>`)
    #[arg(short, long)]
    destination: Option<String>,

    /// IP address of the relay node
    #[arg(long)]
    relay_ip: String,

    /// Peer ID of the relay node
    #[arg(long = "relay-peerid")]
    relay_peer_id: String,

    /// TCP port of the relay node
    #[arg(long)]
    relay_port: Option<u16>,

    /// Disable highlighting of incoming lines
    #[arg(long)]
    no_color: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    logging::init(cli.verbose, &config.logging.level);

    let relay_port = cli.relay_port.unwrap_or(config.peer.relay_port);
    let relay = resolve_with_port(&cli.relay_ip, &cli.relay_peer_id, relay_port)
        .context("Invalid relay address")?;
    let color = config.chat.color && !cli.no_color;

    let stdin = SharedStdin::spawn();
    match (&cli.destination, cli.port) {
        (Some(destination), _) => dial(&relay, destination, color, &stdin).await,
        (None, Some(port)) => listen(&cli, &relay, relay_port, port, color, stdin).await,
        (None, None) => anyhow::bail!("either --port or --destination is required"),
    }
}

fn stdio(stdin: &SharedStdin) -> (SessionInput, SessionOutput) {
    (stdin.input(), Box::new(tokio::io::stdout()))
}

/// Reserve a relay slot and serve chat streams arriving through it
async fn listen(
    cli: &Cli,
    relay: &RelayDescriptor,
    relay_port: u16,
    port: u16,
    color: bool,
    stdin: SharedStdin,
) -> anyhow::Result<()> {
    let host = Host::new(Identity::generate());
    tracing::info!(peer = %host.peer_id(), "listener identity");

    StreamHandler::register(&host, color, move |_: &PeerId| {
        println!("New chat stream opened");
        stdio(&stdin)
    });

    println!("Waiting for relay address...");
    let listen_addr =
        Multiaddr::from_socket_addr(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
    let reservation = ReservationClient::new(host.clone())
        .establish(relay, &listen_addr)
        .await
        .context("Failed to obtain relay address")?;

    let program = std::env::args()
        .next()
        .unwrap_or_else(|| "relaychat".to_string());
    println!("Listening for connections. To connect, run:");
    println!(
        "{}",
        connect_command(
            &program,
            reservation.address(),
            &cli.relay_ip,
            &cli.relay_peer_id,
            relay_port
        )
    );

    tokio::select! {
        () = reservation.closed() => {
            host.shutdown();
            anyhow::bail!("Relay reservation ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
        }
    }

    host.shutdown();
    Ok(())
}

/// Open a chat stream to `destination` and chat on stdin/stdout
async fn dial(
    relay: &RelayDescriptor,
    destination: &str,
    color: bool,
    stdin: &SharedStdin,
) -> anyhow::Result<()> {
    let host = Host::new(Identity::generate());

    host.connect(relay.address())
        .await
        .context("Failed to connect to relay node")?;
    println!("Connected to relay node: {}", relay.address());

    let stream = CircuitDialer::new(host.clone())
        .dial(relay, destination, CHAT_PROTOCOL)
        .await
        .context("Failed to connect to destination")?;
    println!("Connected to destination: {}", destination.trim());
    println!("Chat started. Type messages and press Enter to send.");
    println!("Your Peer ID: {}", host.peer_id());

    let (input, output) = stdio(stdin);
    let end = ChatSession::new(stream, input, output)
        .with_color(color)
        .run()
        .await;

    match end.cause() {
        EndReason::Failed(e) => Err(anyhow::anyhow!("Chat ended: {e}")),
        EndReason::RemoteClosed => {
            println!("Peer closed the chat");
            Ok(())
        }
        EndReason::LocalInputClosed | EndReason::StreamClosed => Ok(()),
    }
}
