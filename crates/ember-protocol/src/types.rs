use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use ember_transport::PublicKey;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Size limits ──────────────────────────────────────────────────────────

/// Largest decrypted application payload, type tag included.
pub const MAX_PACKET_PAYLOAD: usize = 1400;
pub const MAX_MESSAGE_LENGTH: usize = 1372;
pub const MAX_NAME_LENGTH: usize = 128;
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 1007;
pub const MAX_FRIEND_REQUEST_LENGTH: usize = 1016;
pub const MAX_CUSTOM_PACKET_SIZE: usize = 1373;
pub const MAX_FILE_CHUNK: usize = 1371;
pub const MAX_FILENAME_LENGTH: usize = 255;
pub const FILE_ID_LENGTH: usize = 32;
/// Per friend, per direction.
pub const MAX_CONCURRENT_TRANSFERS: usize = 256;
pub const MAX_FRIENDS: usize = 4096;
pub const MAX_GROUPS: usize = 256;
/// Group message text; leaves room for the flood header.
pub const MAX_GROUP_MESSAGE_LENGTH: usize = 1272;
pub const MAX_GROUP_TITLE_LENGTH: usize = 128;

/// Size sentinel for a transfer of unknown length (a stream).
pub const FILE_SIZE_UNBOUNDED: u64 = u64::MAX;

// ── Friend connection ────────────────────────────────────────────────────

/// Connection status of one friend.
///
/// Follows the progression: None -> Connecting -> {ConnectedDirect,
/// ConnectedRelay} -> None.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    None,
    Connecting,
    ConnectedDirect,
    ConnectedRelay,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::ConnectedDirect | Self::ConnectedRelay)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::ConnectedDirect => write!(f, "CONNECTED_DIRECT"),
            Self::ConnectedRelay => write!(f, "CONNECTED_RELAY"),
        }
    }
}

/// Our own reachability: UDP once the DHT answers, TCP while only relay
/// links are up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelfConnectionStatus {
    None,
    Udp,
    Tcp,
}

impl SelfConnectionStatus {
    pub fn is_connected(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for SelfConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// Per-group peer number. Never reused within a group.
pub type PeerNumber = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Normal,
    Action,
}

// ── File transfer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    Data,
    Avatar,
}

/// Host-issued control for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileControl {
    Resume,
    Pause,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Transfer handle, scoped to one friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId {
    pub direction: Direction,
    pub number: u8,
}

impl TransferId {
    pub fn incoming(number: u8) -> Self {
        Self {
            direction: Direction::Incoming,
            number,
        }
    }

    pub fn outgoing(number: u8) -> Self {
        Self {
            direction: Direction::Outgoing,
            number,
        }
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Incoming => write!(f, "in#{}", self.number),
            Direction::Outgoing => write!(f, "out#{}", self.number),
        }
    }
}

/// Observable lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Announced,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl TransferState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Fixed-size random identifiers, serialized as raw bytes.
macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode_upper(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}...)", stringify!($name), hex::encode(&self.0[..5]))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
                let array: [u8; $len] = bytes.as_slice().try_into().map_err(|_| {
                    <D::Error as serde::de::Error>::invalid_length(bytes.len(), &stringify!($len))
                })?;
                Ok(Self(array))
            }
        }
    };
}

random_id!(
    /// Content-derived or random identifier the receiver can present to
    /// resume a transfer.
    FileId,
    FILE_ID_LENGTH
);

random_id!(
    /// Network-wide group identifier.
    GroupId,
    32
);

/// Progress of an unfinished transfer, kept so the host can resume it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub direction: Direction,
    pub file_id: FileId,
    pub kind: FileKind,
    pub size: u64,
    pub filename: String,
    pub position: u64,
}
