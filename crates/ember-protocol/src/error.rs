/// Typed failures of the host API.
///
/// One enum per operation family. Connectivity absence is never an error
/// here: it shows up as a status value, or as `NotConnected` when the
/// caller asks to send.
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FriendAddError {
    #[error("cannot add own key as a friend")]
    OwnKey,
    #[error("friend already exists")]
    AlreadyExists,
    #[error("address checksum mismatch")]
    BadChecksum,
    #[error("friend request needs a message")]
    NoMessage,
    #[error("friend request message too long")]
    TooLong,
    #[error("friend list is full")]
    TooManyFriends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FriendError {
    #[error("friend not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendPacketError {
    #[error("friend not found")]
    NotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("empty payload")]
    Empty,
    #[error("payload too long")]
    TooLong,
    #[error("encoded packet exceeds the channel payload limit")]
    TooLarge,
    #[error("send queue full")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SetInfoError {
    #[error("value too long")]
    TooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileSendError {
    #[error("friend not found")]
    NotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("filename too long")]
    NameTooLong,
    #[error("too many concurrent transfers")]
    TooManyTransfers,
    #[error("send queue full")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileControlError {
    #[error("friend not found")]
    FriendNotFound,
    #[error("transfer not found")]
    NotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("transfer is not paused")]
    NotPaused,
    #[error("control not allowed in the current state")]
    Denied,
    #[error("transfer already paused")]
    AlreadyPaused,
    #[error("transfer already complete")]
    AlreadyComplete,
    #[error("send queue full")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileSeekError {
    #[error("friend not found")]
    FriendNotFound,
    #[error("transfer not found")]
    NotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("seek denied")]
    Denied,
    #[error("send queue full")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileChunkError {
    #[error("friend not found")]
    FriendNotFound,
    #[error("transfer not found")]
    NotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("transfer not transferring")]
    NotTransferring,
    #[error("chunk position does not match the pending request")]
    WrongPosition,
    #[error("chunk length does not match the pending request")]
    InvalidLength,
    #[error("transfer already complete")]
    AlreadyComplete,
    #[error("send queue full")]
    SendQueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileQueryError {
    #[error("friend not found")]
    FriendNotFound,
    #[error("transfer not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("not in group")]
    NotInGroup,
    #[error("friend not found")]
    FriendNotFound,
    #[error("friend not connected")]
    NotConnected,
    #[error("already in group")]
    AlreadyInGroup,
    #[error("malformed invite")]
    InviteMalformed,
    #[error("empty message")]
    Empty,
    #[error("text too long")]
    TooLong,
    #[error("too many groups")]
    TooManyGroups,
    #[error("peer not found")]
    PeerNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RestoreError {
    #[error("saved state is corrupt")]
    Corrupt,
}

/// Rejections of the application packet codec. Always dropped silently by
/// the receive path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("truncated {0} packet")]
    Truncated(&'static str),
    #[error("{what} too large: {size} > {max}")]
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },
    #[error("invalid utf-8 text")]
    InvalidText,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for PacketError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PacketError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PacketError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PacketError::Deserialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime shut down")]
    Shutdown,
    #[error(transparent)]
    FriendAdd(#[from] FriendAddError),
    #[error(transparent)]
    Friend(#[from] FriendError),
    #[error(transparent)]
    SendPacket(#[from] SendPacketError),
}
