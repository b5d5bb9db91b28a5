//! Transport host
//!
//! A [`Host`] owns the process identity, the TCP listeners, the set of
//! addresses the process is reachable on, and the table of protocol
//! handlers. Every connection, direct or relayed, runs the same pipeline:
//!
//! 1. mutual [`handshake`](crate::handshake);
//! 2. the dialer sends [`Negotiation::Select`] naming a protocol;
//! 3. the listener answers [`Negotiation::Accepted`] and hands the
//!    [`Connection`] to the registered handler, or answers
//!    [`Negotiation::Unsupported`].
//!
//! [`Host::upgrade_outbound`] and [`Host::accept_inbound`] run that pipeline
//! over any byte stream, which is how relayed circuits get the same identity
//! guarantees as direct TCP connections.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{recv_message, send_message};
use crate::error::{Error, Result};
use crate::handshake;
use crate::identity::{Identity, PeerId};
use crate::multiaddr::{Multiaddr, Protocol};

/// Byte stream a connection can run over
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Type-erased byte stream
pub type BoxedIo = Box<dyn AsyncIo>;

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Arc<dyn Fn(Connection) -> HandlerFuture + Send + Sync>;

/// Teardown reason recorded by whoever owns the far end of a connection
///
/// Direct TCP connections never record anything. Relayed circuits record the
/// relay's close reason (quota, expiry) so readers report it instead of a bare
/// end-of-stream.
#[derive(Debug, Clone, Default)]
pub struct FaultSlot(Arc<OnceLock<Error>>);

impl FaultSlot {
    /// Record `error`; the first recorded error wins
    pub fn record(&self, error: Error) {
        let _ = self.0.set(error);
    }

    /// The recorded error, if any
    #[must_use]
    pub fn get(&self) -> Option<Error> {
        self.0.get().cloned()
    }
}

/// Protocol negotiation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Negotiation {
    /// Dialer asks for a protocol
    Select {
        /// Protocol identifier
        protocol: String,
    },
    /// Listener serves the protocol
    Accepted,
    /// Listener has no handler for the protocol
    Unsupported,
}

/// Host timeouts
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Handshake plus negotiation timeout
    pub handshake_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Authenticated connection to one remote peer for one protocol
pub struct Connection {
    io: BoxedIo,
    remote: PeerId,
    protocol: String,
    fault: FaultSlot,
}

impl Connection {
    /// Remote peer identity
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// Negotiated protocol
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Teardown slot shared with whoever feeds this connection
    #[must_use]
    pub fn fault(&self) -> &FaultSlot {
        &self.fault
    }

    /// Send one framed message
    ///
    /// # Errors
    ///
    /// Returns a serialization or I/O error.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        send_message(&mut self.io, message).await
    }

    /// Receive one framed message
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClosedStream`] on orderly close, or a serialization
    /// or I/O error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        recv_message(&mut self.io).await
    }

    /// Split into independently owned read and write halves
    #[must_use]
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (reader, writer) = tokio::io::split(self.io);
        (
            ConnectionReader {
                inner: reader,
                remote: self.remote,
            },
            ConnectionWriter { inner: writer },
        )
    }

    /// Give up framing and take the raw byte stream
    #[must_use]
    pub fn into_parts(self) -> (BoxedIo, PeerId, String, FaultSlot) {
        (self.io, self.remote, self.protocol, self.fault)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Read half of a split [`Connection`]
pub struct ConnectionReader {
    inner: ReadHalf<BoxedIo>,
    remote: PeerId,
}

impl ConnectionReader {
    /// Remote peer identity
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// Receive one framed message
    ///
    /// # Errors
    ///
    /// See [`Connection::recv`].
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        recv_message(&mut self.inner).await
    }

    /// Underlying byte reader
    pub fn get_mut(&mut self) -> &mut ReadHalf<BoxedIo> {
        &mut self.inner
    }
}

/// Write half of a split [`Connection`]
pub struct ConnectionWriter {
    inner: WriteHalf<BoxedIo>,
}

impl ConnectionWriter {
    /// Send one framed message
    ///
    /// # Errors
    ///
    /// See [`Connection::send`].
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        send_message(&mut self.inner, message).await
    }

    /// Underlying byte writer
    pub fn get_mut(&mut self) -> &mut WriteHalf<BoxedIo> {
        &mut self.inner
    }

    /// Close the write direction
    pub async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;

        let _ = self.inner.shutdown().await;
    }
}

/// Network host for one process identity
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    identity: Identity,
    config: HostConfig,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    external_addrs: RwLock<Vec<Multiaddr>>,
    handlers: DashMap<String, Handler>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        let listeners = self
            .listeners
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in listeners.drain(..) {
            handle.abort();
        }
    }
}

impl Host {
    /// Create a host with default timeouts
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self::with_config(identity, HostConfig::default())
    }

    /// Create a host with explicit timeouts
    #[must_use]
    pub fn with_config(identity: Identity, config: HostConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                identity,
                config,
                listen_addrs: RwLock::new(Vec::new()),
                external_addrs: RwLock::new(Vec::new()),
                handlers: DashMap::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This host's peer identifier
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// Host configuration
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Bind a TCP listener and start accepting connections
    ///
    /// Returns the bound address, with the actual port if `addr` asked for
    /// port 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `addr` has no `ip/tcp` prefix, or
    /// an I/O error if the bind fails.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr> {
        let socket = addr
            .socket_addr()
            .ok_or(Error::invalid_address("listen address needs an ip and tcp port"))?;
        let listener = TcpListener::bind(socket).await?;
        let bound = Multiaddr::from_socket_addr(listener.local_addr()?);

        write_lock(&self.inner.listen_addrs).push(bound.clone());
        info!(addr = %bound, "listening");

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(accept_loop(listener, weak));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        Ok(bound)
    }

    /// First bound listen address with this host's peer id appended
    #[must_use]
    pub fn dialable_addr(&self) -> Option<Multiaddr> {
        read_lock(&self.inner.listen_addrs)
            .first()
            .cloned()
            .map(|a| a.with(Protocol::P2p(self.peer_id())))
    }

    /// Every address this host is reachable on: bound listeners first, then
    /// externally announced addresses
    #[must_use]
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = read_lock(&self.inner.listen_addrs).clone();
        addrs.extend(read_lock(&self.inner.external_addrs).iter().cloned());
        addrs
    }

    /// Announce an address this host is reachable on without listening on it
    pub fn add_external_addr(&self, addr: Multiaddr) {
        let mut external = write_lock(&self.inner.external_addrs);
        if !external.contains(&addr) {
            debug!(%addr, "external address added");
            external.push(addr);
        }
    }

    /// Withdraw an announced address
    pub fn remove_external_addr(&self, addr: &Multiaddr) {
        let mut external = write_lock(&self.inner.external_addrs);
        let before = external.len();
        external.retain(|a| a != addr);
        if external.len() != before {
            debug!(%addr, "external address removed");
        }
    }

    /// Register the handler for inbound connections negotiating `protocol`
    ///
    /// Replaces any earlier handler for the same protocol.
    pub fn set_stream_handler<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |conn: Connection| -> HandlerFuture { Box::pin(handler(conn)) });
        self.inner.handlers.insert(protocol.into(), handler);
    }

    /// Remove the handler for `protocol`
    pub fn remove_stream_handler(&self, protocol: &str) {
        self.inner.handlers.remove(protocol);
    }

    /// Dial `addr` over TCP and authenticate the remote peer
    ///
    /// If `addr` ends in `/p2p/<id>`, the remote must prove that identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`], [`Error::Timeout`], an I/O error or
    /// a handshake error.
    pub async fn connect(&self, addr: &Multiaddr) -> Result<PeerId> {
        let mut io = self.dial(addr).await?;
        handshake::perform(
            &mut io,
            &self.inner.identity,
            addr.peer_id(),
            self.inner.config.handshake_timeout,
        )
        .await
    }

    /// Dial `addr` over TCP, authenticate, and negotiate `protocol`
    ///
    /// # Errors
    ///
    /// As [`Host::connect`], plus [`Error::UnsupportedProtocol`].
    pub async fn open_stream(&self, addr: &Multiaddr, protocol: &str) -> Result<Connection> {
        let io = self.dial(addr).await?;
        self.upgrade_outbound(Box::new(io), addr.peer_id(), protocol, FaultSlot::default())
            .await
    }

    /// Run the dialer side of the connection pipeline over `io`
    ///
    /// # Errors
    ///
    /// Returns a handshake error, [`Error::Timeout`] or
    /// [`Error::UnsupportedProtocol`].
    pub async fn upgrade_outbound(
        &self,
        mut io: BoxedIo,
        expected: Option<PeerId>,
        protocol: &str,
        fault: FaultSlot,
    ) -> Result<Connection> {
        let timeout = self.inner.config.handshake_timeout;
        let remote = handshake::perform(&mut io, &self.inner.identity, expected, timeout).await?;

        send_message(
            &mut io,
            &Negotiation::Select {
                protocol: protocol.to_string(),
            },
        )
        .await?;

        let reply = tokio::time::timeout(timeout, recv_message::<_, Negotiation>(&mut io))
            .await
            .map_err(|_| Error::timeout("protocol negotiation"))??;

        match reply {
            Negotiation::Accepted => {
                debug!(remote = %remote.short(), %protocol, "stream opened");
                Ok(Connection {
                    io,
                    remote,
                    protocol: protocol.to_string(),
                    fault,
                })
            }
            Negotiation::Unsupported => Err(Error::UnsupportedProtocol(protocol.to_string())),
            Negotiation::Select { .. } => Err(Error::protocol("unexpected select from listener")),
        }
    }

    /// Run the listener side of the connection pipeline over `io`
    ///
    /// The registered handler runs to completion before this returns.
    ///
    /// # Errors
    ///
    /// Returns a handshake error, [`Error::Timeout`] or
    /// [`Error::UnsupportedProtocol`] if no handler matches.
    pub async fn accept_inbound(&self, mut io: BoxedIo, fault: FaultSlot) -> Result<()> {
        let timeout = self.inner.config.handshake_timeout;
        let remote = handshake::perform(&mut io, &self.inner.identity, None, timeout).await?;

        let request = tokio::time::timeout(timeout, recv_message::<_, Negotiation>(&mut io))
            .await
            .map_err(|_| Error::timeout("protocol negotiation"))??;

        let Negotiation::Select { protocol } = request else {
            return Err(Error::protocol("expected protocol selection"));
        };

        // Clone out of the map so no shard lock is held across the handler
        let handler = self.inner.handlers.get(&protocol).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            send_message(&mut io, &Negotiation::Unsupported).await?;
            return Err(Error::UnsupportedProtocol(protocol));
        };

        send_message(&mut io, &Negotiation::Accepted).await?;
        debug!(remote = %remote.short(), %protocol, "inbound stream accepted");

        handler(Connection {
            io,
            remote,
            protocol,
            fault,
        })
        .await;
        Ok(())
    }

    /// Stop every listener
    pub fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
        write_lock(&self.inner.listen_addrs).clear();
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<TcpStream> {
        let socket: SocketAddr = addr
            .socket_addr()
            .ok_or(Error::invalid_address("address needs an ip and tcp port"))?;

        let stream = tokio::time::timeout(self.inner.config.connect_timeout, TcpStream::connect(socket))
            .await
            .map_err(|_| Error::timeout("tcp connect"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("peer_id", &self.peer_id())
            .field("addrs", &self.addrs())
            .finish_non_exhaustive()
    }
}

async fn accept_loop(listener: TcpListener, host: Weak<HostInner>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let Some(inner) = host.upgrade() else {
            break;
        };
        let host = Host { inner };

        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%from, error = %e, "set_nodelay failed");
            }
            if let Err(e) = host.accept_inbound(Box::new(stream), FaultSlot::default()).await {
                debug!(%from, error = %e, "inbound connection ended");
            }
        });
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
