//! Waiting for the relay route to show up
//!
//! Circuit addresses reach the host address set asynchronously, after the
//! relay has granted the reservation. The listener polls for one on a fixed
//! schedule, modelled as a small state machine driven by a timer:
//!
//! ```text
//!            no circuit addr, attempts left
//!              +-------------------+
//!              v                   |
//! start -> Waiting{attempt, deadline} --(found)--> Found
//!              |
//!              +--(no attempts left)--> TimedOut
//! ```

use std::time::Duration;

use relaychat_core::{Error, Host, Multiaddr, Result};
use tokio::time::Instant;
use tracing::debug;

/// Anything that can report its current addresses
pub trait AddressBook {
    /// Current address set
    fn addrs(&self) -> Vec<Multiaddr>;
}

impl AddressBook for Host {
    fn addrs(&self) -> Vec<Multiaddr> {
        Host::addrs(self)
    }
}

/// Polling schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before each check
    pub interval: Duration,
    /// Number of checks before giving up
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

/// Address polling state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressWait {
    /// Next check is `attempt` (1-based), due at `deadline`
    Waiting {
        /// Attempt number of the next check
        attempt: u32,
        /// When the next check runs
        deadline: Instant,
    },
    /// A circuit address appeared
    Found(Multiaddr),
    /// Every attempt came up empty
    TimedOut,
}

impl AddressWait {
    /// Initial state: first check one interval from `now`
    #[must_use]
    pub fn start(policy: &PollPolicy, now: Instant) -> Self {
        if policy.max_attempts == 0 {
            return AddressWait::TimedOut;
        }
        AddressWait::Waiting {
            attempt: 1,
            deadline: now + policy.interval,
        }
    }

    /// Run the check that was due and move to the next state
    #[must_use]
    pub fn step(self, book: &impl AddressBook, policy: &PollPolicy) -> Self {
        let AddressWait::Waiting { attempt, deadline } = self else {
            return self;
        };

        if let Some(addr) = book.addrs().into_iter().find(Multiaddr::is_circuit) {
            debug!(attempt, %addr, "relay address found");
            return AddressWait::Found(addr);
        }

        if attempt >= policy.max_attempts {
            return AddressWait::TimedOut;
        }
        debug!(attempt, "no relay address yet");
        AddressWait::Waiting {
            attempt: attempt + 1,
            deadline: deadline + policy.interval,
        }
    }
}

/// Poll `book` until it reports a `/p2p-circuit` address
///
/// # Errors
///
/// Returns [`Error::ReservationAddressTimeout`] after `policy.max_attempts`
/// empty checks.
pub async fn wait_for_circuit_addr(book: &impl AddressBook, policy: &PollPolicy) -> Result<Multiaddr> {
    let mut state = AddressWait::start(policy, Instant::now());
    loop {
        match state {
            AddressWait::Waiting { deadline, .. } => {
                tokio::time::sleep_until(deadline).await;
                state = state.step(book, policy);
            }
            AddressWait::Found(addr) => return Ok(addr),
            AddressWait::TimedOut => return Err(Error::ReservationAddressTimeout),
        }
    }
}
