/// Friend Connection Manager.
///
/// `connection` turns a public key into a confirmed secure channel and
/// tracks liveness; `reliable` gives it ordered lossless delivery;
/// `wire` frames raw datagrams. [`Friend`] bundles one connection with
/// what we know about the peer.
mod connection;
mod reliable;
pub(crate) mod wire;

pub(crate) use connection::{ConnEvent, Connection, Path, Wire};
pub use reliable::{RECV_BUFFER, SEND_WINDOW};
pub use wire::RequestBody;

use crate::file::FileTransfers;
use crate::types::{PublicKey, ResumePoint};

pub(crate) struct Friend {
    pub public_key: PublicKey,
    pub name: String,
    pub status_message: String,
    /// Peer's typing indicator.
    pub typing: bool,
    /// Ours, towards this peer.
    pub our_typing: bool,
    pub last_seen: u64,
    pub conn: Connection,
    pub transfers: FileTransfers,
    pub resume_points: Vec<ResumePoint>,
    pub next_message_id: u32,
}

impl Friend {
    pub fn new(public_key: PublicKey, request: Option<RequestBody>) -> Self {
        Self {
            public_key,
            name: String::new(),
            status_message: String::new(),
            typing: false,
            our_typing: false,
            last_seen: 0,
            conn: Connection::new(public_key, request),
            transfers: FileTransfers::new(),
            resume_points: Vec::new(),
            next_message_id: 0,
        }
    }

    pub fn take_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }
}
