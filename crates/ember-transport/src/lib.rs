//! Ember transport layer.
//!
//! Long-term identities, the per-friend secure channel, TCP relay
//! framing, and the collaborator traits the protocol core drives:
//! [`Transport`] for datagram and relay I/O, [`Dht`] for address lookup.
//!
//! Wire format: fixed big-endian headers for data, MessagePack for control.
//! Crypto: X25519 + HKDF-SHA256 + XChaCha20-Poly1305.

pub mod channel;
pub mod crypto;
mod error;
mod keys;
pub mod relay;
pub mod sim;
mod transport;

pub use channel::{Reject, ReplayWindow, SecureChannel, CHANNEL_OVERHEAD, REPLAY_WINDOW};
pub use crypto::SessionKeys;
pub use error::{CryptoError, RelayError, TransportError};
pub use keys::{
    Address, Keypair, PublicKey, SecretKey, ADDRESS_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE,
};
pub use relay::{ConnId, RelayAddr, RelayClient, RelayEvent, RelayFrame, RelayServer};
pub use sim::{SimEndpoint, SimNetwork};
pub use transport::{Dht, PathKind, Transport};
