//! Relay service
//!
//! Serves [`RELAY_PROTOCOL`] on a [`Host`]. Three kinds of connection arrive:
//!
//! - **Reserve** from a listener: becomes the reservation's control
//!   connection. The relay pushes `IncomingCircuit` and `ReservationExpired`
//!   over it; a further `Reserve` on it renews the reservation; closing it
//!   releases the reservation.
//! - **Connect** from a dialer: the relay admits a pending circuit, signals
//!   the destination, and waits for it to connect back.
//! - **Accept** from a destination: picks up a pending circuit, after which
//!   the relay splices the two connections together.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use relaychat_core::{Connection, Error, Host, Multiaddr, PeerId, Protocol, RejectReason, Result};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::limits::RelayLimits;
use crate::protocol::{CircuitId, CloseReason, HopMessage, RELAY_PROTOCOL};
use crate::splice::splice;
use crate::state::{Circuit, CircuitTable, Quota, Reservation, ReservationTable};

/// How long a pending circuit waits for the destination to accept
pub const CIRCUIT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue depth of messages pushed to one reservation holder
const CONTROL_QUEUE: usize = 16;

struct ControlHandle {
    id: u64,
    tx: mpsc::Sender<HopMessage>,
}

struct PendingAccept {
    dst: PeerId,
    tx: oneshot::Sender<Connection>,
}

#[derive(Default)]
struct RelayState {
    reservations: ReservationTable,
    circuits: CircuitTable,
    controls: HashMap<PeerId, ControlHandle>,
    pending: HashMap<CircuitId, PendingAccept>,
    next_control_id: u64,
}

impl RelayState {
    /// Drop a reservation and everything hanging off it
    fn drop_reservation(&mut self, peer: &PeerId, reason: CloseReason) {
        self.controls.remove(peer);
        self.pending.retain(|_, p| p.dst != *peer);
        let torn = self.circuits.tear_down_for(peer, reason);
        if torn > 0 {
            debug!(peer = %peer.short(), circuits = torn, ?reason, "circuits torn down");
        }
    }
}

/// A circuit the relay admitted and is waiting on
pub struct CircuitHandle {
    circuit: Circuit,
    quota: Arc<Quota>,
    accepted: oneshot::Receiver<Connection>,
    teardown: watch::Receiver<Option<CloseReason>>,
}

impl CircuitHandle {
    /// The admitted circuit
    #[must_use]
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }
}

impl std::fmt::Debug for CircuitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitHandle")
            .field("circuit", &self.circuit)
            .finish_non_exhaustive()
    }
}

/// Circuit relay
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    host: Host,
    limits: RelayLimits,
    state: RwLock<RelayState>,
}

impl RelayService {
    /// Start relaying on `host`
    ///
    /// Registers the relay protocol handler; the host's listeners must be
    /// bound separately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the limits do not validate.
    pub fn new(host: Host, limits: RelayLimits) -> Result<Self> {
        limits.validate()?;

        let service = Self {
            inner: Arc::new(ServiceInner {
                host: host.clone(),
                limits,
                state: RwLock::new(RelayState::default()),
            }),
        };

        let weak = Arc::downgrade(&service.inner);
        host.set_stream_handler(RELAY_PROTOCOL, move |conn: Connection| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    RelayService { inner }.handle(conn).await;
                }
            }
        });

        info!(
            max_reservations = service.inner.limits.max_reservations,
            max_circuits = service.inner.limits.max_circuits,
            "relay service started"
        );
        Ok(service)
    }

    /// Host the relay runs on
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Configured limits
    #[must_use]
    pub fn limits(&self) -> &RelayLimits {
        &self.inner.limits
    }

    /// Grant or renew a reservation for `peer`
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservationDenied`] with `NotAdmitted` or `AtCapacity`.
    pub async fn request_reservation(&self, peer: PeerId) -> Result<Reservation> {
        let addrs = self.circuit_addrs();
        let grant = {
            let mut state = self.inner.state.write().await;
            let grant = state
                .reservations
                .request(peer, &self.inner.limits, addrs, Instant::now())
                .map_err(Error::ReservationDenied)?;
            if grant.replaced_lapsed {
                state
                    .circuits
                    .tear_down_for(&peer, CloseReason::ReservationExpired);
            }
            grant
        };

        let reservation = grant.reservation;
        self.spawn_expiry(peer, reservation.generation, reservation.expires_at);

        info!(
            peer = %peer.short(),
            renewed = grant.renewed,
            remaining = reservation.quota.remaining(),
            "reservation granted"
        );
        Ok(reservation)
    }

    /// Admit a circuit from `src` to `dst` and signal the destination
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitRejected`] with `NoSuchReservation` if `dst`
    /// holds no live reservation, `AtCapacity` if the circuit limit is
    /// reached, or `ConnectFailed` if the destination cannot be signalled.
    pub async fn open_circuit(&self, src: PeerId, dst: PeerId) -> Result<CircuitHandle> {
        let mut state = self.inner.state.write().await;
        let now = Instant::now();

        let quota = state
            .reservations
            .get(&dst, now)
            .map(|r| Arc::clone(&r.quota))
            .ok_or(Error::CircuitRejected(RejectReason::NoSuchReservation))?;

        let RelayState {
            reservations,
            circuits,
            ..
        } = &mut *state;
        let (circuit, teardown) = circuits
            .open(src, dst, reservations, &self.inner.limits, now)
            .map_err(Error::CircuitRejected)?;

        let signalled = state.controls.get(&dst).is_some_and(|control| {
            control
                .tx
                .try_send(HopMessage::IncomingCircuit {
                    circuit_id: circuit.id,
                    src,
                })
                .is_ok()
        });
        if !signalled {
            state.circuits.reject(circuit.id);
            return Err(Error::CircuitRejected(RejectReason::ConnectFailed));
        }

        let (tx, accepted) = oneshot::channel();
        state.pending.insert(circuit.id, PendingAccept { dst, tx });

        debug!(circuit = circuit.id, src = %src.short(), dst = %dst.short(), "circuit pending");
        Ok(CircuitHandle {
            circuit,
            quota,
            accepted,
            teardown,
        })
    }

    /// Drop `peer`'s reservation and close its circuits
    pub async fn release(&self, peer: &PeerId) {
        let mut state = self.inner.state.write().await;
        if state.reservations.release(peer).is_some() {
            state.drop_reservation(peer, CloseReason::Normal);
            info!(peer = %peer.short(), "reservation released");
        }
    }

    /// Live reservations
    pub async fn reservation_count(&self) -> usize {
        self.inner.state.read().await.reservations.live(Instant::now())
    }

    /// Pending plus open circuits
    pub async fn circuit_count(&self) -> usize {
        self.inner.state.read().await.circuits.active()
    }

    /// `<listen addr>/p2p/<relay id>/p2p-circuit` for every listen address
    fn circuit_addrs(&self) -> Vec<Multiaddr> {
        let relay = self.inner.host.peer_id();
        self.inner
            .host
            .addrs()
            .into_iter()
            .filter(|a| !a.is_circuit())
            .map(|a| a.with(Protocol::P2p(relay)).with(Protocol::P2pCircuit))
            .collect()
    }

    fn spawn_expiry(&self, peer: PeerId, generation: u64, expires_at: Instant) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(inner) = weak.upgrade() {
                RelayService { inner }.expire(peer, generation).await;
            }
        });
    }

    async fn expire(&self, peer: PeerId, generation: u64) {
        let mut state = self.inner.state.write().await;
        if state.reservations.expire(&peer, generation).is_none() {
            return;
        }
        if let Some(control) = state.controls.get(&peer) {
            let _ = control.tx.try_send(HopMessage::ReservationExpired);
        }
        state.drop_reservation(&peer, CloseReason::ReservationExpired);
        info!(peer = %peer.short(), "reservation expired");
    }

    async fn handle(&self, mut conn: Connection) {
        let peer = conn.remote_peer();
        let first = match conn.recv::<HopMessage>().await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %peer.short(), error = %e, "relay stream closed before request");
                return;
            }
        };
        debug!(peer = %peer.short(), msg = first.message_type(), "relay request");

        match first {
            HopMessage::Reserve => self.serve_reservation(conn).await,
            HopMessage::Connect { dst } => self.serve_connect(conn, dst).await,
            HopMessage::Accept { circuit_id } => self.serve_accept(conn, circuit_id).await,
            other => {
                warn!(peer = %peer.short(), msg = other.message_type(), "unexpected relay request");
            }
        }
    }

    async fn serve_reservation(&self, mut conn: Connection) {
        let peer = conn.remote_peer();

        let reservation = match self.request_reservation(peer).await {
            Ok(r) => r,
            Err(e) => {
                info!(peer = %peer.short(), error = %e, "reservation refused");
                let reason = match e {
                    Error::ReservationDenied(reason) => reason,
                    _ => RejectReason::AtCapacity,
                };
                let _ = conn.send(&HopMessage::Rejected { reason }).await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel(CONTROL_QUEUE);
        let replies = tx.downgrade();
        let control_id = {
            let mut state = self.inner.state.write().await;
            state.next_control_id += 1;
            let id = state.next_control_id;
            state.controls.insert(peer, ControlHandle { id, tx });
            id
        };

        if conn.send(&grant_message(&reservation)).await.is_err() {
            self.control_closed(peer, control_id).await;
            return;
        }

        let (mut reader, mut writer) = conn.split();
        let service = self.clone();
        let mut holder = tokio::spawn(async move {
            loop {
                match reader.recv::<HopMessage>().await {
                    Ok(HopMessage::Release) | Err(_) => return,
                    Ok(HopMessage::Reserve) => {
                        let reply = service.renew(peer, control_id).await;
                        // Upgraded only for the send so a release still ends the control loop
                        let Some(tx) = replies.upgrade() else { return };
                        if tx.send(reply).await.is_err() {
                            return;
                        }
                    }
                    Ok(other) => debug!(msg = other.message_type(), "ignoring control message"),
                }
            }
        });

        loop {
            tokio::select! {
                pushed = rx.recv() => {
                    let Some(msg) = pushed else { break };
                    let last = matches!(msg, HopMessage::ReservationExpired);
                    if writer.send(&msg).await.is_err() || last {
                        break;
                    }
                }
                _ = &mut holder => break,
            }
        }

        holder.abort();
        writer.shutdown().await;
        self.control_closed(peer, control_id).await;
    }

    /// Renewal requested over the control connection `control_id`
    async fn renew(&self, peer: PeerId, control_id: u64) -> HopMessage {
        let current = {
            let state = self.inner.state.read().await;
            state.controls.get(&peer).is_some_and(|c| c.id == control_id)
        };
        if !current {
            return HopMessage::Rejected {
                reason: RejectReason::NoSuchReservation,
            };
        }

        match self.request_reservation(peer).await {
            Ok(reservation) => grant_message(&reservation),
            Err(Error::ReservationDenied(reason)) => {
                info!(peer = %peer.short(), ?reason, "renewal refused");
                HopMessage::Rejected { reason }
            }
            Err(_) => HopMessage::Rejected {
                reason: RejectReason::AtCapacity,
            },
        }
    }

    /// Release the reservation if `control_id` is still its control connection
    async fn control_closed(&self, peer: PeerId, control_id: u64) {
        let mut state = self.inner.state.write().await;
        let current = state.controls.get(&peer).is_some_and(|c| c.id == control_id);
        if current {
            state.reservations.release(&peer);
            state.drop_reservation(&peer, CloseReason::Normal);
            info!(peer = %peer.short(), "reservation holder disconnected");
        }
    }

    async fn serve_connect(&self, mut conn: Connection, dst: PeerId) {
        let src = conn.remote_peer();

        let handle = match self.open_circuit(src, dst).await {
            Ok(handle) => handle,
            Err(e) => {
                info!(src = %src.short(), dst = %dst.short(), error = %e, "circuit refused");
                let reason = match e {
                    Error::CircuitRejected(reason) => reason,
                    _ => RejectReason::ConnectFailed,
                };
                let _ = conn.send(&HopMessage::Rejected { reason }).await;
                return;
            }
        };
        let CircuitHandle {
            circuit,
            quota,
            accepted,
            teardown,
        } = handle;

        let mut dst_conn = match tokio::time::timeout(CIRCUIT_ACCEPT_TIMEOUT, accepted).await {
            Ok(Ok(dst_conn)) => dst_conn,
            _ => {
                {
                    let mut state = self.inner.state.write().await;
                    state.pending.remove(&circuit.id);
                    state.circuits.reject(circuit.id);
                }
                info!(circuit = circuit.id, "destination did not accept circuit");
                let _ = conn
                    .send(&HopMessage::Rejected {
                        reason: RejectReason::ConnectFailed,
                    })
                    .await;
                return;
            }
        };

        if !self.inner.state.write().await.circuits.mark_open(circuit.id) {
            // Torn down while the destination was connecting back
            let _ = conn
                .send(&HopMessage::Rejected {
                    reason: RejectReason::NoSuchReservation,
                })
                .await;
            return;
        }

        if conn.send(&HopMessage::Connected).await.is_err()
            || dst_conn.send(&HopMessage::Accepted).await.is_err()
        {
            self.inner.state.write().await.circuits.close(circuit.id);
            return;
        }

        info!(circuit = circuit.id, src = %src.short(), dst = %dst.short(), "circuit open");
        let reason = splice(conn, dst_conn, quota, teardown).await;

        self.inner.state.write().await.circuits.close(circuit.id);
        info!(circuit = circuit.id, ?reason, "circuit closed");
    }

    async fn serve_accept(&self, mut conn: Connection, circuit_id: CircuitId) {
        let peer = conn.remote_peer();

        let pending = {
            let mut state = self.inner.state.write().await;
            match state.pending.get(&circuit_id) {
                Some(p) if p.dst == peer => state.pending.remove(&circuit_id),
                _ => None,
            }
        };

        let Some(pending) = pending else {
            warn!(peer = %peer.short(), circuit = circuit_id, "accept for unknown circuit");
            let _ = conn
                .send(&HopMessage::Rejected {
                    reason: RejectReason::ConnectFailed,
                })
                .await;
            return;
        };

        if let Err(mut conn) = pending.tx.send(conn) {
            let _ = conn
                .send(&HopMessage::Rejected {
                    reason: RejectReason::ConnectFailed,
                })
                .await;
        }
    }
}

fn grant_message(reservation: &Reservation) -> HopMessage {
    let ttl = reservation.expires_at.saturating_duration_since(Instant::now());
    HopMessage::ReserveOk {
        addrs: reservation.addrs.clone(),
        ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        data_limit: reservation.quota.remaining(),
    }
}

impl std::fmt::Debug for RelayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("peer_id", &self.inner.host.peer_id())
            .field("limits", &self.inner.limits)
            .finish_non_exhaustive()
    }
}
