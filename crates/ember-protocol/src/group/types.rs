/// Group wire types.
///
/// Three packet families travel over friend connections: the invite
/// cookie, point-to-point sync messages between two members, and flooded
/// broadcasts carrying `(origin, seq)` for duplicate suppression.
use serde::{Deserialize, Serialize};

use crate::error::PacketError;
use crate::types::{GroupId, MessageKind, PublicKey};

/// Opaque cookie handed to the invitee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    pub group_id: GroupId,
    pub title: String,
}

impl GroupInvite {
    pub fn to_cookie(&self) -> Result<Vec<u8>, PacketError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_cookie(cookie: &[u8]) -> Result<Self, PacketError> {
        Ok(rmp_serde::from_slice(cookie)?)
    }
}

/// Last-writer-wins stamp for the group title. Compared by counter, then
/// by author key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TitleVersion {
    pub counter: u32,
    pub author: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub public_key: PublicKey,
    pub name: String,
}

/// Messages exchanged between two directly linked members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupSync {
    /// Invitee accepting an invite.
    Join { group_id: GroupId, name: String },
    /// Full state snapshot, answered to `Join`.
    State {
        group_id: GroupId,
        title: String,
        title_version: Option<TitleVersion>,
        peers: Vec<PeerEntry>,
    },
    /// Ask a fellow member to relay to us.
    Link { group_id: GroupId, name: String },
}

impl GroupSync {
    pub fn group_id(&self) -> GroupId {
        match self {
            Self::Join { group_id, .. } | Self::State { group_id, .. } | Self::Link { group_id, .. } => {
                *group_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastBody {
    Message { kind: MessageKind, text: String },
    Title { text: String, version: TitleVersion },
    PeerJoined { public_key: PublicKey, name: String },
    PeerLeft { public_key: PublicKey },
    PeerName { name: String },
    Alive,
}

/// A flooded group item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBroadcast {
    pub group_id: GroupId,
    pub origin: PublicKey,
    pub seq: u64,
    pub body: BroadcastBody,
}
