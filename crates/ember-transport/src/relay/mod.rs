/// TCP relay plumbing.
///
/// A relay server forwards opaque payloads between clients that asked
/// to be routed to each other. Each client multiplexes many peers over
/// one relay link using small connection ids assigned by the server.
mod client;
mod server;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{PublicKey, TransportError};

pub use client::{RelayClient, RelayEvent};
pub use server::RelayServer;

/// Maximum simultaneous routes one client may hold on a relay.
pub const MAX_ROUTES: usize = 240;

/// Per-link route identifier, assigned by the server.
pub type ConnId = u8;

/// A relay server: where to reach it and who it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayAddr {
    pub addr: SocketAddr,
    pub public_key: PublicKey,
}

impl fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.public_key)
    }
}

/// Parses `ip:port@HEXKEY`.
impl FromStr for RelayAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, key) = s
            .split_once('@')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let addr = addr
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self {
            addr,
            public_key: key.trim().parse()?,
        })
    }
}

/// Frames exchanged on a relay link, MessagePack encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → server: identify.
    Hello { public_key: PublicKey },
    /// Server → client: link accepted.
    Welcome,
    /// Client → server: route me to `peer`.
    RouteRequest { peer: PublicKey },
    /// Server → client: `peer` is reachable via `conn_id` once online.
    RouteResponse { conn_id: ConnId, peer: PublicKey },
    /// Server → client: routing table full.
    RouteRejected { peer: PublicKey },
    /// Server → client: both ends of `conn_id` are present.
    Connected { conn_id: ConnId },
    /// Either direction: the route is gone.
    Disconnected { conn_id: ConnId },
    /// Either direction: opaque payload for the route.
    Data {
        conn_id: ConnId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl RelayFrame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}
