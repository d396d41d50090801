use std::net::SocketAddr;

use crate::PublicKey;

/// Errors returned by the Ember transport layer.
///
/// Send failures are transient: callers keep the packet queued and try
/// again on a later tick.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("udp is disabled on this endpoint")]
    UdpDisabled,

    #[error("no route to {0}")]
    Unreachable(SocketAddr),

    #[error("relay {0} is not reachable")]
    RelayUnavailable(SocketAddr),

    #[error("datagram too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("frame serialization failed: {0}")]
    Serialization(String),

    #[error("frame deserialization failed: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Deserialization(e.to_string())
    }
}

/// Failure of a crypto primitive. Always reported as an authentication
/// failure, whatever the underlying cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Errors from the relay client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no online relay route to {0}")]
    NoRoute(PublicKey),

    #[error("relay {0} is not configured")]
    UnknownRelay(SocketAddr),
}
