/// Persisted node state.
///
/// `b"EMBR"` followed by a MessagePack [`SaveData`]. Anything that does not
/// decode to the current version is `Corrupt`.
use ember_transport::{RelayAddr, SecretKey, SECRET_KEY_SIZE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RestoreError;
use crate::friend::RequestBody;
use crate::types::{PublicKey, ResumePoint};

const MAGIC: &[u8; 4] = b"EMBR";
pub const SAVE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SavedFriend {
    pub public_key: PublicKey,
    pub name: String,
    pub status_message: String,
    pub last_seen: u64,
    /// Still unanswered friend request of ours.
    pub request: Option<RequestBody>,
    pub resume_points: Vec<ResumePoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SaveData {
    pub version: u32,
    #[serde(with = "serde_bytes")]
    pub secret_key: Vec<u8>,
    pub nospam: u32,
    pub name: String,
    pub status_message: String,
    pub friends: Vec<SavedFriend>,
    pub relays: Vec<RelayAddr>,
}

impl SaveData {
    pub fn secret_key(&self) -> Result<SecretKey, RestoreError> {
        let bytes: [u8; SECRET_KEY_SIZE] = self
            .secret_key
            .as_slice()
            .try_into()
            .map_err(|_| RestoreError::Corrupt)?;
        Ok(SecretKey::from_bytes(bytes))
    }
}

pub(crate) fn encode(data: &SaveData) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let mut out = MAGIC.to_vec();
    rmp_serde::encode::write(&mut out, data)?;
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<SaveData, RestoreError> {
    let body = bytes.strip_prefix(MAGIC).ok_or(RestoreError::Corrupt)?;
    let data: SaveData = rmp_serde::from_slice(body).map_err(|e| {
        debug!("save data undecodable: {e}");
        RestoreError::Corrupt
    })?;
    if data.version != SAVE_VERSION {
        debug!(version = data.version, "unsupported save version");
        return Err(RestoreError::Corrupt);
    }
    data.secret_key()?;
    Ok(data)
}
