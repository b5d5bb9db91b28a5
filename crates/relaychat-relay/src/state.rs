//! Reservation and circuit bookkeeping
//!
//! Plain data structures with no I/O. [`RelayService`](crate::RelayService)
//! keeps both tables behind one lock and passes the current time in, which
//! keeps every admission decision testable without a runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relaychat_core::{Multiaddr, PeerId, RejectReason};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::limits::RelayLimits;
use crate::protocol::{CircuitId, CloseReason};

/// Remaining data allowance of one reservation
///
/// Shared by every circuit of the reservation and by both forwarding
/// directions of each circuit.
#[derive(Debug)]
pub struct Quota {
    remaining: AtomicU64,
}

impl Quota {
    /// Quota with `limit` bytes available
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: AtomicU64::new(limit),
        }
    }

    /// Bytes still available
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take up to `wanted` bytes and return how many were granted
    ///
    /// A grant smaller than `wanted` means the quota is now exhausted.
    pub fn consume(&self, wanted: u64) -> u64 {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                (remaining > 0).then(|| remaining - remaining.min(wanted))
            }) {
            Ok(previous) => previous.min(wanted),
            Err(_) => 0,
        }
    }
}

/// A granted reservation
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Peer holding the slot
    pub holder: PeerId,
    /// Relay addresses that reach the holder, each ending in `/p2p-circuit`
    pub addrs: Vec<Multiaddr>,
    /// When the reservation ends unless renewed
    pub expires_at: Instant,
    /// Data allowance
    pub quota: Arc<Quota>,
    /// Bumped on every (re)grant so stale expiry timers can be ignored
    pub generation: u64,
}

/// Outcome of a successful reservation request
#[derive(Debug, Clone)]
pub struct Grant {
    /// The reservation as it now stands
    pub reservation: Reservation,
    /// True if an existing live reservation was extended
    pub renewed: bool,
    /// True if a lapsed reservation whose expiry had not yet been processed
    /// was replaced
    pub replaced_lapsed: bool,
}

/// Live reservations keyed by holder
#[derive(Debug, Default)]
pub struct ReservationTable {
    entries: HashMap<PeerId, Reservation>,
    next_generation: u64,
}

impl ReservationTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or renew a reservation for `peer`
    ///
    /// Admission is checked before capacity. A renewal keeps the remaining
    /// quota and never needs a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::NotAdmitted`] or [`RejectReason::AtCapacity`].
    pub fn request(
        &mut self,
        peer: PeerId,
        limits: &RelayLimits,
        addrs: Vec<Multiaddr>,
        now: Instant,
    ) -> Result<Grant, RejectReason> {
        if !limits.admission.admits(&peer) {
            return Err(RejectReason::NotAdmitted);
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let expires_at = now + limits.reservation_duration;

        if let Some(existing) = self.entries.get_mut(&peer) {
            if existing.expires_at > now {
                existing.expires_at = expires_at;
                existing.generation = generation;
                existing.addrs = addrs;
                return Ok(Grant {
                    reservation: existing.clone(),
                    renewed: true,
                    replaced_lapsed: false,
                });
            }
        }

        let lapsed = self
            .entries
            .get(&peer)
            .is_some_and(|existing| existing.expires_at <= now);
        let live_others = self
            .entries
            .values()
            .filter(|r| r.holder != peer && r.expires_at > now)
            .count();
        if live_others >= limits.max_reservations {
            return Err(RejectReason::AtCapacity);
        }

        let reservation = Reservation {
            holder: peer,
            addrs,
            expires_at,
            quota: Arc::new(Quota::new(limits.max_data_per_reservation)),
            generation,
        };
        self.entries.insert(peer, reservation.clone());

        Ok(Grant {
            reservation,
            renewed: false,
            replaced_lapsed: lapsed,
        })
    }

    /// Live reservation held by `peer`
    #[must_use]
    pub fn get(&self, peer: &PeerId, now: Instant) -> Option<&Reservation> {
        self.entries.get(peer).filter(|r| r.expires_at > now)
    }

    /// Drop `peer`'s reservation
    pub fn release(&mut self, peer: &PeerId) -> Option<Reservation> {
        self.entries.remove(peer)
    }

    /// Drop `peer`'s reservation if it is still the given generation
    pub fn expire(&mut self, peer: &PeerId, generation: u64) -> Option<Reservation> {
        match self.entries.get(peer) {
            Some(r) if r.generation == generation => self.entries.remove(peer),
            _ => None,
        }
    }

    /// Reservations whose expiry is still in the future
    #[must_use]
    pub fn live(&self, now: Instant) -> usize {
        self.entries.values().filter(|r| r.expires_at > now).count()
    }
}

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Waiting for the destination to accept
    Pending,
    /// Spliced and forwarding
    Open,
    /// Ended after being open
    Closed,
    /// Never opened
    Rejected,
}

/// One circuit between a dialer and a reservation holder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// Relay-assigned identifier
    pub id: CircuitId,
    /// Dialing peer
    pub src: PeerId,
    /// Reservation holder
    pub dst: PeerId,
    /// Current status
    pub status: CircuitStatus,
}

#[derive(Debug)]
struct CircuitEntry {
    circuit: Circuit,
    teardown: watch::Sender<Option<CloseReason>>,
}

/// Pending and open circuits
///
/// Closed and rejected circuits leave the table.
#[derive(Debug, Default)]
pub struct CircuitTable {
    entries: HashMap<CircuitId, CircuitEntry>,
    next_id: CircuitId,
}

impl CircuitTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new pending circuit from `src` to `dst`
    ///
    /// The returned receiver fires when the circuit must be torn down.
    ///
    /// # Errors
    ///
    /// Returns [`RejectReason::NoSuchReservation`] if `dst` holds no live
    /// reservation, or [`RejectReason::AtCapacity`] if `max_circuits` pending
    /// and open circuits already exist.
    pub fn open(
        &mut self,
        src: PeerId,
        dst: PeerId,
        reservations: &ReservationTable,
        limits: &RelayLimits,
        now: Instant,
    ) -> Result<(Circuit, watch::Receiver<Option<CloseReason>>), RejectReason> {
        if reservations.get(&dst, now).is_none() {
            return Err(RejectReason::NoSuchReservation);
        }
        if self.entries.len() >= limits.max_circuits {
            return Err(RejectReason::AtCapacity);
        }

        self.next_id += 1;
        let circuit = Circuit {
            id: self.next_id,
            src,
            dst,
            status: CircuitStatus::Pending,
        };
        let (teardown, rx) = watch::channel(None);
        self.entries.insert(
            circuit.id,
            CircuitEntry {
                circuit: circuit.clone(),
                teardown,
            },
        );
        Ok((circuit, rx))
    }

    /// Pending -> Open
    pub fn mark_open(&mut self, id: CircuitId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.circuit.status == CircuitStatus::Pending => {
                entry.circuit.status = CircuitStatus::Open;
                true
            }
            _ => false,
        }
    }

    /// Pending -> Rejected, removing the circuit
    pub fn reject(&mut self, id: CircuitId) -> Option<Circuit> {
        self.finish(id, CircuitStatus::Rejected)
    }

    /// Open -> Closed, removing the circuit
    pub fn close(&mut self, id: CircuitId) -> Option<Circuit> {
        self.finish(id, CircuitStatus::Closed)
    }

    /// Signal teardown to every circuit ending at `dst`
    ///
    /// The forwarding tasks remove the circuits as they wind down.
    pub fn tear_down_for(&mut self, dst: &PeerId, reason: CloseReason) -> usize {
        let mut count = 0;
        for entry in self.entries.values().filter(|e| e.circuit.dst == *dst) {
            entry.teardown.send_replace(Some(reason));
            count += 1;
        }
        count
    }

    /// Circuit by id
    #[must_use]
    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.entries.get(&id).map(|e| &e.circuit)
    }

    /// Pending plus open circuits
    #[must_use]
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    fn finish(&mut self, id: CircuitId, status: CircuitStatus) -> Option<Circuit> {
        self.entries.remove(&id).map(|entry| {
            let mut circuit = entry.circuit;
            circuit.status = status;
            circuit
        })
    }
}
