use std::fmt;
use std::net::SocketAddr;

use crate::{PublicKey, TransportError};

/// The kind of network path a friend connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Direct UDP datagrams to a DHT-resolved address.
    Direct,
    /// Traffic forwarded by a TCP relay server.
    Relay,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct => write!(f, "DIRECT"),
            PathKind::Relay => write!(f, "RELAY"),
        }
    }
}

/// Non-blocking datagram and relay-stream I/O.
///
/// Every method returns immediately. `poll_*` yields one queued inbound
/// item or `None`; the core drains them once per tick. Send errors are
/// transient and the core retries on a later tick.
pub trait Transport: Send {
    /// Send one UDP datagram.
    fn send_udp(&mut self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError>;

    /// Next received UDP datagram with its source address.
    fn poll_udp(&mut self) -> Option<(SocketAddr, Vec<u8>)>;

    /// Send one encoded frame on the stream to a relay server.
    fn send_relay(&mut self, relay: SocketAddr, frame: &[u8]) -> Result<(), TransportError>;

    /// Next frame received from any relay server.
    fn poll_relay(&mut self) -> Option<(SocketAddr, Vec<u8>)>;
}

/// Key → address resolution. Best effort, no guarantees beyond eventual
/// discovery.
pub trait Dht: Send {
    /// Candidate UDP addresses for `public_key`. May be empty.
    fn resolve(&mut self, public_key: &PublicKey) -> Vec<SocketAddr>;

    /// Seed the table with a known node.
    fn bootstrap(&mut self, addr: SocketAddr, public_key: PublicKey);

    /// At least one live DHT node answers us over UDP.
    fn is_connected(&self) -> bool;
}
