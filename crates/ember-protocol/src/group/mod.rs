/// Group Broadcast Overlay.
mod overlay;
mod types;

pub(crate) use overlay::{Contacts, GroupAction, GroupOverlay};
pub use overlay::{GroupPeer, SELF_PEER};
pub use types::{BroadcastBody, GroupBroadcast, GroupInvite, GroupSync, PeerEntry, TitleVersion};
