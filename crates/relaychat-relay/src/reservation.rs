//! Listener side: reserving a slot on a relay
//!
//! ```text
//! listener                      relay
//!    | -- Reserve ------------>  |
//!    | <------------ ReserveOk -- |      control connection stays open
//!    |                            |
//!    | <------ IncomingCircuit -- |      a dialer asked for us
//!    | == new connection =======> |
//!    | -- Accept{id} ----------> |
//!    | <------------- Accepted -- |      handshake + protocol run over it
//!    |                            |
//!    | -- Reserve ------------>  |      on the control connection, once
//!    | <------------ ReserveOk -- |      three quarters of the lease ran
//! ```

use std::time::Duration;

use relaychat_core::{
    Connection, ConnectionWriter, Error, Host, Multiaddr, PeerId, Protocol, Result,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit::bridge;
use crate::poll::{PollPolicy, wait_for_circuit_addr};
use crate::protocol::{CircuitId, HopMessage, RELAY_PROTOCOL};
use crate::resolver::RelayDescriptor;

/// Reserves relay slots for a host
#[derive(Debug, Clone)]
pub struct ReservationClient {
    host: Host,
    policy: PollPolicy,
    renew: bool,
}

/// Terms of the latest grant
#[derive(Debug, Clone, Copy)]
struct Lease {
    expires_at: Instant,
    ttl: Duration,
}

impl Lease {
    fn granted(ttl_millis: u64) -> Self {
        let ttl = Duration::from_millis(ttl_millis);
        Self {
            expires_at: Instant::now() + ttl,
            ttl,
        }
    }

    /// Three quarters into the lease
    fn renew_at(&self) -> Instant {
        self.expires_at
            .checked_sub(self.ttl / 4)
            .unwrap_or(self.expires_at)
    }
}

/// A reservation held open by a background control task
///
/// Dropping it gives the reservation up.
#[derive(Debug)]
pub struct ActiveReservation {
    address: Multiaddr,
    lease: watch::Receiver<Lease>,
    data_limit: u64,
    closed: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ActiveReservation {
    /// `<relay>/p2p-circuit/p2p/<local id>`, the address dialers use
    #[must_use]
    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    /// When the relay will end the reservation unless it is renewed
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.lease.borrow().expires_at
    }

    /// Bytes the relay will forward for this reservation
    #[must_use]
    pub fn data_limit(&self) -> u64 {
        self.data_limit
    }

    /// True once the reservation has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves when the reservation ends (expiry, relay disconnect)
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        loop {
            let ended = *rx.borrow_and_update();
            if ended || rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for ActiveReservation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Withdraws the announced circuit address when the control task ends,
/// however it ends
struct AnnouncedAddr {
    host: Host,
    addr: Multiaddr,
    closed: watch::Sender<bool>,
}

impl Drop for AnnouncedAddr {
    fn drop(&mut self) {
        self.host.remove_external_addr(&self.addr);
        self.closed.send_replace(true);
    }
}

impl ReservationClient {
    /// Client with the default address polling schedule
    #[must_use]
    pub fn new(host: Host) -> Self {
        Self::with_policy(host, PollPolicy::default())
    }

    /// Client with an explicit address polling schedule
    #[must_use]
    pub fn with_policy(host: Host, policy: PollPolicy) -> Self {
        Self {
            host,
            policy,
            renew: true,
        }
    }

    /// Whether reservations are renewed before they expire (default on)
    #[must_use]
    pub fn with_renewal(mut self, renew: bool) -> Self {
        self.renew = renew;
        self
    }

    /// Bind `listen_addr`, reserve a slot on `relay`, and wait until the
    /// relay route is part of the host's address set
    ///
    /// # Errors
    ///
    /// - an I/O error if `listen_addr` cannot be bound
    /// - [`Error::RelayUnreachable`] if the relay cannot be reached
    /// - [`Error::ReservationDenied`] if the relay refuses
    /// - [`Error::ReservationAddressTimeout`] if the route never appears
    pub async fn establish(
        &self,
        relay: &RelayDescriptor,
        listen_addr: &Multiaddr,
    ) -> Result<ActiveReservation> {
        let bound = self.host.listen(listen_addr).await?;
        debug!(addr = %bound, "listener bound");

        let mut conn = self
            .host
            .open_stream(relay.address(), RELAY_PROTOCOL)
            .await
            .map_err(|e| Error::RelayUnreachable(e.to_string().into()))?;
        info!(relay = %relay, "connected to relay");

        conn.send(&HopMessage::Reserve)
            .await
            .map_err(|e| Error::RelayUnreachable(e.to_string().into()))?;

        let (ttl_millis, data_limit) = match conn.recv::<HopMessage>().await {
            Ok(HopMessage::ReserveOk {
                addrs,
                ttl_millis,
                data_limit,
            }) => {
                debug!(?addrs, ttl_millis, data_limit, "reservation granted");
                (ttl_millis, data_limit)
            }
            Ok(HopMessage::Rejected { reason }) => return Err(Error::ReservationDenied(reason)),
            Ok(other) => {
                return Err(Error::Protocol(
                    format!("unexpected {} in reply to Reserve", other.message_type()).into(),
                ));
            }
            Err(e) => return Err(Error::RelayUnreachable(e.to_string().into())),
        };
        let (lease_tx, lease) = watch::channel(Lease::granted(ttl_millis));

        let (closed_tx, closed) = watch::channel(false);
        let announced = AnnouncedAddr {
            host: self.host.clone(),
            addr: relay.circuit_addr(),
            closed: closed_tx,
        };
        let task = tokio::spawn(control_loop(
            self.host.clone(),
            relay.clone(),
            conn,
            announced,
            lease_tx,
            self.renew,
        ));

        let found = match wait_for_circuit_addr(&self.host, &self.policy).await {
            Ok(addr) => addr,
            Err(e) => {
                task.abort();
                return Err(e);
            }
        };

        Ok(ActiveReservation {
            address: found.with(Protocol::P2p(self.host.peer_id())),
            lease,
            data_limit,
            closed,
            task,
        })
    }
}

async fn control_loop(
    host: Host,
    relay: RelayDescriptor,
    conn: Connection,
    announced: AnnouncedAddr,
    lease: watch::Sender<Lease>,
    renew: bool,
) {
    host.add_external_addr(announced.addr.clone());

    let (mut reader, writer) = conn.split();
    let renewer = tokio::spawn(keep_renewed(writer, lease.subscribe(), renew));

    loop {
        match reader.recv::<HopMessage>().await {
            Ok(HopMessage::IncomingCircuit { circuit_id, src }) => {
                tokio::spawn(accept_circuit(host.clone(), relay.clone(), circuit_id, src));
            }
            Ok(HopMessage::ReserveOk { ttl_millis, .. }) => {
                debug!(relay = %relay, ttl_millis, "reservation renewed");
                lease.send_replace(Lease::granted(ttl_millis));
            }
            Ok(HopMessage::Rejected { reason }) => {
                warn!(relay = %relay, ?reason, "reservation renewal refused");
            }
            Ok(HopMessage::ReservationExpired) => {
                info!(relay = %relay, "reservation expired");
                break;
            }
            Ok(other) => {
                debug!(msg = other.message_type(), "ignoring relay message");
            }
            Err(e) => {
                warn!(relay = %relay, error = %e, "lost connection to relay");
                break;
            }
        }
    }

    renewer.abort();
    drop(announced);
}

/// Ask for a renewal whenever the current lease is three quarters through
///
/// The relay answers on the control connection; the reader installs the new
/// lease, which schedules the next round.
async fn keep_renewed(
    mut writer: ConnectionWriter,
    mut lease: watch::Receiver<Lease>,
    renew: bool,
) {
    if !renew {
        // Holds the write half open for the life of the reservation
        std::future::pending::<()>().await;
    }

    loop {
        let renew_at = lease.borrow_and_update().renew_at();
        tokio::time::sleep_until(renew_at).await;

        if let Err(e) = writer.send(&HopMessage::Reserve).await {
            debug!(error = %e, "renewal request failed");
            return;
        }
        if lease.changed().await.is_err() {
            return;
        }
    }
}

async fn accept_circuit(host: Host, relay: RelayDescriptor, circuit_id: CircuitId, src: PeerId) {
    debug!(circuit = circuit_id, src = %src.short(), "incoming circuit");

    let mut conn = match host.open_stream(relay.address(), RELAY_PROTOCOL).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(circuit = circuit_id, error = %e, "cannot reach relay to accept circuit");
            return;
        }
    };

    if let Err(e) = request_accept(&mut conn, circuit_id).await {
        warn!(circuit = circuit_id, error = %e, "circuit accept failed");
        return;
    }

    let (io, fault) = bridge(conn);
    if let Err(e) = host.accept_inbound(io, fault).await {
        warn!(circuit = circuit_id, src = %src.short(), error = %e, "relayed stream failed");
    }
}

async fn request_accept(conn: &mut Connection, circuit_id: CircuitId) -> Result<()> {
    conn.send(&HopMessage::Accept { circuit_id }).await?;
    match conn.recv::<HopMessage>().await? {
        HopMessage::Accepted => Ok(()),
        HopMessage::Rejected { reason } => Err(Error::CircuitRejected(reason)),
        other => Err(Error::Protocol(
            format!("unexpected {} in reply to Accept", other.message_type()).into(),
        )),
    }
}
