//! Relay, listener and dialer on loopback
//!
//! Every node binds `127.0.0.1` on an ephemeral port, so tests run
//! concurrently without port bookkeeping.
//!
//! # Example
//!
//! ```no_run
//! use relaychat_chat::CHAT_PROTOCOL;
//! use relaychat_integration_tests::fixtures::{ChatListener, RelayNode, dial, open_limits};
//!
//! # async fn demo() {
//! let relay = RelayNode::start(open_limits()).await;
//! let mut listener = ChatListener::start(&relay).await.unwrap();
//! let stream = dial(&relay, &listener.address(), CHAT_PROTOCOL).await.unwrap();
//! let mut terminal = listener.next_terminal().await;
//! # }
//! ```

use std::time::Duration;

use relaychat_chat::{ChatSession, SessionInput, SessionOutput, StreamHandler};
use relaychat_core::{Host, Identity, PeerId, Result, Stream};
use relaychat_relay::{
    ActiveReservation, AdmissionPolicy, CircuitDialer, PollPolicy, RelayDescriptor, RelayLimits,
    RelayService, ReservationClient, resolve_with_port,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

/// Listen address for every fixture node
pub const LOOPBACK: &str = "/ip4/127.0.0.1/tcp/0";

const TERMINAL_BUFFER: usize = 64 * 1024;
const WAIT: Duration = Duration::from_secs(10);

/// Generous limits admitting everyone
pub fn open_limits() -> RelayLimits {
    RelayLimits {
        max_reservations: 8,
        max_circuits: 8,
        reservation_duration: Duration::from_secs(60),
        max_data_per_reservation: 1 << 20,
        admission: AdmissionPolicy::AllowAll,
    }
}

/// Address polling fast enough for tests
pub fn fast_poll() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(20),
        max_attempts: 100,
    }
}

/// A running relay
pub struct RelayNode {
    /// The relay service
    pub service: RelayService,
    /// How peers reach it
    pub descriptor: RelayDescriptor,
}

impl RelayNode {
    /// Start a relay with `limits` on loopback
    pub async fn start(limits: RelayLimits) -> Self {
        let host = Host::new(Identity::generate());
        let service = RelayService::new(host.clone(), limits).expect("valid relay limits");
        let bound = host
            .listen(&LOOPBACK.parse().expect("loopback address"))
            .await
            .expect("relay listens");
        let port = bound.socket_addr().expect("tcp listen address").port();
        let descriptor = resolve_with_port("127.0.0.1", &host.peer_id().to_string(), port)
            .expect("relay descriptor");
        Self {
            service,
            descriptor,
        }
    }
}

/// The local side of a chat session: what the user types and sees
pub struct Terminal {
    /// Peer at the other end
    pub remote: PeerId,
    /// Write here to type
    pub keyboard: DuplexStream,
    /// Read here to see incoming lines
    pub screen: DuplexStream,
}

impl Terminal {
    /// Type `line` as-is
    pub async fn type_line(&mut self, line: &str) {
        self.keyboard
            .write_all(line.as_bytes())
            .await
            .expect("keyboard write");
    }

    /// Read exactly `len` bytes of screen output
    pub async fn read_screen(&mut self, len: usize) -> String {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(WAIT, self.screen.read_exact(&mut buf))
            .await
            .expect("screen output in time")
            .expect("screen read");
        String::from_utf8(buf).expect("utf-8 screen output")
    }

    /// Read screen output until the session drops its end
    pub async fn read_screen_to_end(&mut self) -> String {
        let mut buf = Vec::new();
        tokio::time::timeout(WAIT, self.screen.read_to_end(&mut buf))
            .await
            .expect("session ends in time")
            .expect("screen read");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn wire(remote: PeerId) -> (SessionInput, SessionOutput, Terminal) {
    let (keyboard, input) = tokio::io::duplex(TERMINAL_BUFFER);
    let (output, screen) = tokio::io::duplex(TERMINAL_BUFFER);
    let terminal = Terminal {
        remote,
        keyboard,
        screen,
    };
    (Box::new(BufReader::new(input)), Box::new(output), terminal)
}

/// A chat session over `stream` driven through an in-memory terminal
pub fn terminal_session(stream: Stream, color: bool) -> (ChatSession, Terminal) {
    let (input, output, terminal) = wire(stream.remote_peer());
    (
        ChatSession::new(stream, input, output).with_color(color),
        terminal,
    )
}

/// A peer listening for chats through a relay
pub struct ChatListener {
    /// The listener's host
    pub host: Host,
    /// Its relay reservation
    pub reservation: ActiveReservation,
    terminals: mpsc::UnboundedReceiver<Terminal>,
}

impl ChatListener {
    /// Reserve a slot on `relay` and serve chat streams with highlighting on
    ///
    /// # Errors
    ///
    /// Returns whatever reservation establishment returns.
    pub async fn start(relay: &RelayNode) -> Result<Self> {
        Self::start_with_renewal(relay, true).await
    }

    /// Like [`ChatListener::start`], choosing whether the reservation is
    /// renewed
    ///
    /// # Errors
    ///
    /// Returns whatever reservation establishment returns.
    pub async fn start_with_renewal(relay: &RelayNode, renew: bool) -> Result<Self> {
        let host = Host::new(Identity::generate());
        let (tx, terminals) = mpsc::unbounded_channel();
        StreamHandler::register(&host, true, move |remote: &PeerId| {
            let (input, output, terminal) = wire(*remote);
            let _ = tx.send(terminal);
            (input, output)
        });

        let reservation = ReservationClient::with_policy(host.clone(), fast_poll())
            .with_renewal(renew)
            .establish(&relay.descriptor, &LOOPBACK.parse()?)
            .await?;

        Ok(Self {
            host,
            reservation,
            terminals,
        })
    }

    /// The address dialers use
    pub fn address(&self) -> String {
        self.reservation.address().to_string()
    }

    /// Terminal of the next inbound chat session
    pub async fn next_terminal(&mut self) -> Terminal {
        tokio::time::timeout(WAIT, self.terminals.recv())
            .await
            .expect("inbound chat in time")
            .expect("listener still registered")
    }
}

/// Dial `destination` through `relay` from a fresh peer
///
/// # Errors
///
/// Returns whatever [`CircuitDialer::dial`] returns.
pub async fn dial(relay: &RelayNode, destination: &str, protocol: &str) -> Result<Stream> {
    CircuitDialer::new(Host::new(Identity::generate()))
        .dial(&relay.descriptor, destination, protocol)
        .await
}
