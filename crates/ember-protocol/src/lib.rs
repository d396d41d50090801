//! Ember protocol core.
//!
//! Friend connections over direct UDP or TCP relays, reliable and lossy
//! application packets, chunked file transfer, and flood-based group chat.
//!
//! The core is single-threaded and poll-driven: a [`Node`] does nothing
//! until the host calls [`Node::iterate`], and reports everything through
//! an [`EventSink`]. [`NodeRuntime`] drives a node from a tokio task for
//! hosts that prefer channels.
//!
//! Network I/O is injected through the [`Transport`] and [`Dht`] traits of
//! `ember-transport`; its [`SimNetwork`] runs whole networks in memory.

mod arena;
mod config;
pub mod error;
mod events;
mod file;
mod friend;
mod group;
mod node;
pub mod packet;
mod runtime;
mod save;
pub mod types;

pub use arena::{FriendId, GroupNumber, Handle};
pub use config::{NodeConfig, RELAYS_ENV};
pub use error::{
    FileChunkError, FileControlError, FileQueryError, FileSeekError, FileSendError,
    FriendAddError, FriendError, GroupError, PacketError, RestoreError, RuntimeError,
    SendPacketError, SetInfoError,
};
pub use events::{Event, EventSink};
pub use friend::{RequestBody, RECV_BUFFER, SEND_WINDOW};
pub use group::{
    BroadcastBody, GroupBroadcast, GroupInvite, GroupPeer, GroupSync, PeerEntry, TitleVersion,
    SELF_PEER,
};
pub use node::Node;
pub use runtime::{NodeRuntime, RuntimeChannels, RuntimeCommand, RuntimeConfig, RuntimeHandle};
pub use save::SAVE_VERSION;
pub use types::{
    now_ms, ConnectionStatus, Direction, FileControl, FileId, FileKind, GroupId, MessageKind,
    PeerNumber, ResumePoint, SelfConnectionStatus, TransferId, TransferState,
};

pub use ember_transport::{
    Address, Dht, Keypair, PathKind, PublicKey, RelayAddr, RelayServer, SecretKey, SimEndpoint,
    SimNetwork, Transport,
};
