//! Self-describing peer addresses
//!
//! Addresses are a sequence of `/protocol/value` components:
//!
//! ```text
//! /ip4/203.0.113.7/tcp/4001/p2p/<relay id>                         direct
//! /ip4/203.0.113.7/tcp/4001/p2p/<relay id>/p2p-circuit/p2p/<peer>  relayed
//! ```
//!
//! Only the components relaychat routes on are supported: `ip4`, `ip6`,
//! `tcp`, `p2p` and the value-less `p2p-circuit` marker.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Marker component separating the relay part of an address from the
/// destination part
pub const CIRCUIT_MARKER: &str = "p2p-circuit";

/// One address component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// IPv4 network address
    Ip4(Ipv4Addr),
    /// IPv6 network address
    Ip6(Ipv6Addr),
    /// TCP port
    Tcp(u16),
    /// Peer identifier
    P2p(PeerId),
    /// Relay circuit marker
    P2pCircuit,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Protocol::Tcp(port) => write!(f, "/tcp/{port}"),
            Protocol::P2p(peer) => write!(f, "/p2p/{peer}"),
            Protocol::P2pCircuit => write!(f, "/{CIRCUIT_MARKER}"),
        }
    }
}

/// Parsed address
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multiaddr(Vec<Protocol>);

impl Multiaddr {
    /// Empty address
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `/ip4|ip6/<ip>/tcp/<port>` for a socket address
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self(vec![ip, Protocol::Tcp(addr.port())])
    }

    /// Append a component
    pub fn push(&mut self, protocol: Protocol) {
        self.0.push(protocol);
    }

    /// Copy of this address with `protocol` appended
    #[must_use]
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.push(protocol);
        self
    }

    /// Iterate over components
    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.0.iter()
    }

    /// Number of components
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the address has no components
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the address routes through a relay circuit
    #[must_use]
    pub fn is_circuit(&self) -> bool {
        self.0.contains(&Protocol::P2pCircuit)
    }

    /// The peer the address ultimately points at (last `/p2p` component)
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        self.0.iter().rev().find_map(|p| match p {
            Protocol::P2p(peer) => Some(*peer),
            _ => None,
        })
    }

    /// Dialable socket address from a leading `ip4|ip6` + `tcp` pair
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.0.as_slice() {
            [Protocol::Ip4(ip), Protocol::Tcp(port), ..] => Some(SocketAddr::new((*ip).into(), *port)),
            [Protocol::Ip6(ip), Protocol::Tcp(port), ..] => Some(SocketAddr::new((*ip).into(), *port)),
            _ => None,
        }
    }

    /// Split `<relay>/p2p-circuit/p2p/<peer>` into the relay part and the
    /// destination peer
    ///
    /// Returns `None` unless the address has exactly one circuit marker
    /// followed by exactly one `/p2p` component.
    #[must_use]
    pub fn split_circuit(&self) -> Option<(Multiaddr, PeerId)> {
        let marker = self.0.iter().position(|p| *p == Protocol::P2pCircuit)?;
        match &self.0[marker + 1..] {
            [Protocol::P2p(peer)] if marker > 0 => Some((Multiaddr(self.0[..marker].to_vec()), *peer)),
            _ => None,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for protocol in &self.0 {
            write!(f, "{protocol}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('/')
            .ok_or(Error::invalid_address("address must start with '/'"))?;
        if rest.is_empty() {
            return Err(Error::invalid_address("empty address"));
        }

        let mut parts = rest.split('/');
        let mut components = Vec::new();

        while let Some(name) = parts.next() {
            let protocol = match name {
                "ip4" => Protocol::Ip4(value(&mut parts, "ip4")?.parse().map_err(|_| {
                    Error::invalid_address("ip4 component is not an IPv4 literal")
                })?),
                "ip6" => Protocol::Ip6(value(&mut parts, "ip6")?.parse().map_err(|_| {
                    Error::invalid_address("ip6 component is not an IPv6 literal")
                })?),
                "tcp" => Protocol::Tcp(
                    value(&mut parts, "tcp")?
                        .parse()
                        .map_err(|_| Error::invalid_address("tcp component is not a port"))?,
                ),
                "p2p" => Protocol::P2p(value(&mut parts, "p2p")?.parse()?),
                CIRCUIT_MARKER => Protocol::P2pCircuit,
                "" => return Err(Error::invalid_address("empty address component")),
                other => {
                    return Err(Error::InvalidAddress(
                        format!("unsupported address component '{other}'").into(),
                    ));
                }
            };
            components.push(protocol);
        }

        Ok(Self(components))
    }
}

fn value<'a>(parts: &mut impl Iterator<Item = &'a str>, name: &'static str) -> Result<&'a str> {
    match parts.next() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::InvalidAddress(
            format!("missing value for '{name}'").into(),
        )),
    }
}

impl From<Vec<Protocol>> for Multiaddr {
    fn from(components: Vec<Protocol>) -> Self {
        Self(components)
    }
}
