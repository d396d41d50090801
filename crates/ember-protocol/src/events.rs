/// Host notifications.
///
/// Everything the core reports is an [`Event`]. Events are queued during
/// an iteration and handed to an [`EventSink`] at its end. A sink either
/// takes every event through [`EventSink::event`] or overrides the
/// per-kind methods it cares about.
use crate::arena::{FriendId, GroupNumber};
use crate::types::{
    ConnectionStatus, FileControl, FileId, FileKind, MessageKind, PeerNumber, PublicKey,
    SelfConnectionStatus, TransferId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Our own reachability changed.
    SelfConnectionStatus {
        status: SelfConnectionStatus,
    },
    ConnectionStatus {
        friend: FriendId,
        status: ConnectionStatus,
    },
    FriendRequest {
        public_key: PublicKey,
        message: String,
    },
    FriendMessage {
        friend: FriendId,
        kind: MessageKind,
        text: String,
    },
    FriendName {
        friend: FriendId,
        name: String,
    },
    FriendStatusMessage {
        friend: FriendId,
        status_message: String,
    },
    FriendTyping {
        friend: FriendId,
        typing: bool,
    },
    LosslessPacket {
        friend: FriendId,
        data: Vec<u8>,
    },
    LossyPacket {
        friend: FriendId,
        data: Vec<u8>,
    },
    FileAnnounce {
        friend: FriendId,
        transfer: TransferId,
        kind: FileKind,
        size: u64,
        filename: String,
        file_id: FileId,
    },
    FileControl {
        friend: FriendId,
        transfer: TransferId,
        control: FileControl,
    },
    /// The receiver wants `length` bytes at `position`. A zero length
    /// marks the completion exchange, answered by the core itself.
    FileChunkRequest {
        friend: FriendId,
        transfer: TransferId,
        position: u64,
        length: usize,
    },
    /// Empty `data` marks the end of the transfer.
    FileChunk {
        friend: FriendId,
        transfer: TransferId,
        position: u64,
        data: Vec<u8>,
    },
    GroupInvite {
        friend: FriendId,
        cookie: Vec<u8>,
    },
    GroupMessage {
        group: GroupNumber,
        peer: PeerNumber,
        kind: MessageKind,
        text: String,
    },
    GroupTitle {
        group: GroupNumber,
        peer: Option<PeerNumber>,
        title: String,
    },
    GroupPeerListChanged {
        group: GroupNumber,
    },
    GroupPeerName {
        group: GroupNumber,
        peer: PeerNumber,
        name: String,
    },
}

impl Event {
    /// Route to the matching per-kind method of `sink`.
    pub fn dispatch<S: EventSink + ?Sized>(self, sink: &mut S) {
        match self {
            Self::SelfConnectionStatus { status } => sink.self_connection_status(status),
            Self::ConnectionStatus { friend, status } => sink.connection_status(friend, status),
            Self::FriendRequest {
                public_key,
                message,
            } => sink.friend_request(public_key, message),
            Self::FriendMessage { friend, kind, text } => sink.friend_message(friend, kind, text),
            Self::FriendName { friend, name } => sink.friend_name(friend, name),
            Self::FriendStatusMessage {
                friend,
                status_message,
            } => sink.friend_status_message(friend, status_message),
            Self::FriendTyping { friend, typing } => sink.friend_typing(friend, typing),
            Self::LosslessPacket { friend, data } => sink.lossless_packet(friend, data),
            Self::LossyPacket { friend, data } => sink.lossy_packet(friend, data),
            Self::FileAnnounce {
                friend,
                transfer,
                kind,
                size,
                filename,
                file_id,
            } => sink.file_announce(friend, transfer, kind, size, filename, file_id),
            Self::FileControl {
                friend,
                transfer,
                control,
            } => sink.file_control(friend, transfer, control),
            Self::FileChunkRequest {
                friend,
                transfer,
                position,
                length,
            } => sink.file_chunk_request(friend, transfer, position, length),
            Self::FileChunk {
                friend,
                transfer,
                position,
                data,
            } => sink.file_chunk(friend, transfer, position, data),
            Self::GroupInvite { friend, cookie } => sink.group_invite(friend, cookie),
            Self::GroupMessage {
                group,
                peer,
                kind,
                text,
            } => sink.group_message(group, peer, kind, text),
            Self::GroupTitle { group, peer, title } => sink.group_title(group, peer, title),
            Self::GroupPeerListChanged { group } => sink.group_peer_list_changed(group),
            Self::GroupPeerName { group, peer, name } => sink.group_peer_name(group, peer, name),
        }
    }
}

/// Receiver of host notifications. Every method defaults to a no-op.
///
/// Called from inside the iteration; implementations must not call back
/// into the node.
#[allow(unused_variables)]
pub trait EventSink {
    /// Entry point for every event. The default routes to the per-kind
    /// methods below.
    fn event(&mut self, event: Event) {
        event.dispatch(self);
    }

    fn self_connection_status(&mut self, status: SelfConnectionStatus) {}
    fn connection_status(&mut self, friend: FriendId, status: ConnectionStatus) {}
    fn friend_request(&mut self, public_key: PublicKey, message: String) {}
    fn friend_message(&mut self, friend: FriendId, kind: MessageKind, text: String) {}
    fn friend_name(&mut self, friend: FriendId, name: String) {}
    fn friend_status_message(&mut self, friend: FriendId, status_message: String) {}
    fn friend_typing(&mut self, friend: FriendId, typing: bool) {}
    fn lossless_packet(&mut self, friend: FriendId, data: Vec<u8>) {}
    fn lossy_packet(&mut self, friend: FriendId, data: Vec<u8>) {}
    fn file_announce(
        &mut self,
        friend: FriendId,
        transfer: TransferId,
        kind: FileKind,
        size: u64,
        filename: String,
        file_id: FileId,
    ) {
    }
    fn file_control(&mut self, friend: FriendId, transfer: TransferId, control: FileControl) {}
    fn file_chunk_request(
        &mut self,
        friend: FriendId,
        transfer: TransferId,
        position: u64,
        length: usize,
    ) {
    }
    fn file_chunk(&mut self, friend: FriendId, transfer: TransferId, position: u64, data: Vec<u8>) {}
    fn group_invite(&mut self, friend: FriendId, cookie: Vec<u8>) {}
    fn group_message(&mut self, group: GroupNumber, peer: PeerNumber, kind: MessageKind, text: String) {}
    fn group_title(&mut self, group: GroupNumber, peer: Option<PeerNumber>, title: String) {}
    fn group_peer_list_changed(&mut self, group: GroupNumber) {}
    fn group_peer_name(&mut self, group: GroupNumber, peer: PeerNumber, name: String) {}
}

/// Collects events for later inspection.
impl EventSink for Vec<Event> {
    fn event(&mut self, event: Event) {
        self.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn friend() -> FriendId {
        let mut arena: Arena<()> = Arena::with_limit(1);
        FriendId(arena.try_insert(()).unwrap())
    }

    #[derive(Default)]
    struct Counter {
        messages: Vec<String>,
        statuses: usize,
        own: Vec<SelfConnectionStatus>,
    }

    impl EventSink for Counter {
        fn friend_message(&mut self, _: FriendId, _: MessageKind, text: String) {
            self.messages.push(text);
        }

        fn connection_status(&mut self, _: FriendId, _: ConnectionStatus) {
            self.statuses += 1;
        }

        fn self_connection_status(&mut self, status: SelfConnectionStatus) {
            self.own.push(status);
        }
    }

    #[test]
    fn default_event_routes_to_kind_methods() {
        let mut sink = Counter::default();
        let f = friend();
        sink.event(Event::FriendMessage {
            friend: f,
            kind: MessageKind::Normal,
            text: "hi".into(),
        });
        sink.event(Event::ConnectionStatus {
            friend: f,
            status: ConnectionStatus::Connecting,
        });
        sink.event(Event::FriendTyping {
            friend: f,
            typing: true,
        });
        sink.event(Event::SelfConnectionStatus {
            status: SelfConnectionStatus::Tcp,
        });
        assert_eq!(sink.messages, vec!["hi".to_string()]);
        assert_eq!(sink.statuses, 1);
        assert_eq!(sink.own, vec![SelfConnectionStatus::Tcp]);
    }

    #[test]
    fn vec_sink_keeps_everything() {
        let mut sink: Vec<Event> = Vec::new();
        let f = friend();
        sink.event(Event::FriendTyping {
            friend: f,
            typing: false,
        });
        assert_eq!(sink.len(), 1);
    }
}
