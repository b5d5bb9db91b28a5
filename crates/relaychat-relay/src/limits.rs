//! Relay resource limits
//!
//! A relay forwards traffic for strangers, so every limit is an explicit
//! operator decision. There is no `Default` impl.

use std::collections::HashSet;
use std::time::Duration;

use relaychat_core::{Error, PeerId, Result};

/// Which peers may hold a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Any authenticated peer
    AllowAll,
    /// Only the listed peers
    AllowList(HashSet<PeerId>),
}

impl AdmissionPolicy {
    /// Check whether `peer` may reserve
    #[must_use]
    pub fn admits(&self, peer: &PeerId) -> bool {
        match self {
            AdmissionPolicy::AllowAll => true,
            AdmissionPolicy::AllowList(allowed) => allowed.contains(peer),
        }
    }
}

/// Relay limits
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Concurrent reservations
    pub max_reservations: usize,
    /// Concurrent circuits, pending and open, across all reservations
    pub max_circuits: usize,
    /// Lifetime of a reservation from its latest (re)grant
    pub reservation_duration: Duration,
    /// Bytes forwarded per reservation, both directions, all circuits
    pub max_data_per_reservation: u64,
    /// Admission policy
    pub admission: AdmissionPolicy,
}

impl RelayLimits {
    /// Check the limits make sense
    ///
    /// Zero reservations, circuits or data are accepted: they describe a
    /// relay that refuses that resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero reservation duration or an
    /// empty allow list.
    pub fn validate(&self) -> Result<()> {
        if self.reservation_duration.is_zero() {
            return Err(Error::InvalidConfig(
                "reservation duration must be positive".into(),
            ));
        }
        if let AdmissionPolicy::AllowList(allowed) = &self.admission {
            if allowed.is_empty() {
                return Err(Error::InvalidConfig("allow list is empty".into()));
            }
        }
        Ok(())
    }
}
