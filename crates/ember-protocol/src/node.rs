/// Node — iteration scheduler and host API.
///
/// A `Node` owns every friend connection, transfer and group. Nothing runs
/// on its own: the host calls [`Node::iterate`] (or [`Node::iterate_at`]
/// with its own clock) every [`Node::iteration_interval`], and the events
/// queued during the tick are handed to the sink at its end. API calls
/// between iterations change local state at once and send right away when
/// the friend is connected.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use ember_transport::{Address, Dht, Keypair, RelayAddr, RelayClient, RelayEvent, SecretKey, Transport};
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::arena::{Arena, FriendId, GroupNumber};
use crate::config::{NodeConfig, Timing};
use crate::error::{
    FileChunkError, FileControlError, FileQueryError, FileSeekError, FileSendError,
    FriendAddError, FriendError, GroupError, RestoreError, SendPacketError, SetInfoError,
};
use crate::events::{Event, EventSink};
use crate::file::{FileAction, FileTransfers};
use crate::friend::{wire, ConnEvent, Friend, Path, RequestBody, Wire};
use crate::group::{Contacts, GroupAction, GroupOverlay, GroupPeer};
use crate::packet::Packet;
use crate::save::{self, SaveData, SavedFriend, SAVE_VERSION};
use crate::types::{
    now_ms, ConnectionStatus, FileControl, FileId, FileKind, GroupId, MessageKind, PeerNumber,
    PublicKey, ResumePoint, SelfConnectionStatus, TransferId, TransferState, MAX_CUSTOM_PACKET_SIZE, MAX_FRIENDS,
    MAX_FRIEND_REQUEST_LENGTH, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH, MAX_STATUS_MESSAGE_LENGTH,
};

/// Friend requests remembered so each one is surfaced once.
const SEEN_REQUESTS: usize = 64;

const IDLE_INTERVAL: Duration = Duration::from_millis(50);
const BUSY_INTERVAL: Duration = Duration::from_millis(10);

/// Friend table as the group overlay sees it.
struct Roster<'a> {
    friends: &'a Arena<Friend>,
    by_key: &'a HashMap<PublicKey, FriendId>,
}

impl Contacts for Roster<'_> {
    fn online(&self, public_key: &PublicKey) -> Option<FriendId> {
        let id = *self.by_key.get(public_key)?;
        self.friends
            .get(id.0)
            .filter(|f| f.conn.is_connected())
            .map(|_| id)
    }

    fn public_key(&self, friend: FriendId) -> Option<PublicKey> {
        self.friends.get(friend.0).map(|f| f.public_key)
    }
}

fn send_to(friend: &mut Friend, wire: &mut Wire, packet: &Packet, now: u64) -> Result<(), SendPacketError> {
    let bytes = packet.encode().map_err(|e| {
        debug!(peer = %friend.public_key.fmt_short(), "packet not encodable: {e}");
        SendPacketError::TooLarge
    })?;
    friend.conn.send_packet(bytes, packet.is_lossy(), now, wire)
}

pub struct Node {
    wire: Wire,
    nospam: u32,
    name: String,
    status_message: String,
    friends: Arena<Friend>,
    by_key: HashMap<PublicKey, FriendId>,
    groups: GroupOverlay,
    seen_requests: LruCache<PublicKey, ()>,
    self_status: SelfConnectionStatus,
    /// Queued for the sink at the end of the tick.
    events: Vec<Event>,
    /// Time of the last iteration; API calls use it.
    clock: u64,
}

impl Node {
    /// Start a node. A fresh identity is generated unless the config
    /// carries a secret key.
    pub fn new(config: NodeConfig, transport: Box<dyn Transport>, dht: Box<dyn Dht>) -> Self {
        Self::build(config, transport, dht, rand::random())
    }

    fn build(config: NodeConfig, transport: Box<dyn Transport>, dht: Box<dyn Dht>, nospam: u32) -> Self {
        let keypair = match config.secret_key.clone() {
            Some(secret) => Keypair::from_secret(secret),
            None => Keypair::generate(),
        };
        let timing = Timing::from(&config);
        let mut relays = RelayClient::new(keypair.public());
        for relay in &config.relays {
            relays.add_relay(*relay);
        }
        info!(
            public_key = %keypair.public().fmt_short(),
            udp = config.udp_enabled,
            relays = config.relays.len(),
            "node started"
        );
        let groups = GroupOverlay::new(keypair.public(), &timing);
        let seen = NonZeroUsize::new(SEEN_REQUESTS).unwrap_or(NonZeroUsize::MIN);
        Self {
            wire: Wire {
                transport,
                dht,
                relays,
                keypair,
                udp_enabled: config.udp_enabled,
                timing,
            },
            nospam,
            name: String::new(),
            status_message: String::new(),
            friends: Arena::with_limit(MAX_FRIENDS),
            by_key: HashMap::new(),
            groups,
            seen_requests: LruCache::new(seen),
            self_status: SelfConnectionStatus::None,
            events: Vec::new(),
            clock: 0,
        }
    }

    /// Rebuild a node from [`serialize_state`](Self::serialize_state)
    /// output. The saved identity replaces any key in `config`.
    pub fn restore(
        config: NodeConfig,
        transport: Box<dyn Transport>,
        dht: Box<dyn Dht>,
        state: &[u8],
    ) -> Result<Self, RestoreError> {
        let data = save::decode(state)?;
        let config = config.secret_key(data.secret_key()?);
        let mut node = Self::build(config, transport, dht, data.nospam);
        node.name = data.name.clone();
        node.groups.set_name(data.name);
        node.status_message = data.status_message;
        for relay in data.relays {
            node.wire.relays.add_relay(relay);
        }
        for saved in data.friends {
            let public_key = saved.public_key;
            let mut friend = Friend::new(public_key, saved.request);
            friend.name = saved.name;
            friend.status_message = saved.status_message;
            friend.last_seen = saved.last_seen;
            friend.resume_points = saved.resume_points;
            let handle = node
                .friends
                .try_insert(friend)
                .map_err(|_| RestoreError::Corrupt)?;
            node.by_key.insert(public_key, FriendId(handle));
        }
        info!(friends = node.friends.len(), "state restored");
        Ok(node)
    }

    /// Identity, profile, friends and their resume points. Connections,
    /// transfers and groups are not persisted.
    pub fn serialize_state(&self) -> Vec<u8> {
        let data = SaveData {
            version: SAVE_VERSION,
            secret_key: self.wire.keypair.secret().to_bytes().to_vec(),
            nospam: self.nospam,
            name: self.name.clone(),
            status_message: self.status_message.clone(),
            friends: self
                .friends
                .iter()
                .map(|(_, f)| SavedFriend {
                    public_key: f.public_key,
                    name: f.name.clone(),
                    status_message: f.status_message.clone(),
                    last_seen: f.last_seen,
                    request: f.conn.request().cloned(),
                    resume_points: f.resume_points.clone(),
                })
                .collect(),
            relays: self.wire.relays.relays(),
        };
        match save::encode(&data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("state encoding failed: {e}");
                Vec::new()
            }
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    pub fn public_key(&self) -> PublicKey {
        self.wire.keypair.public()
    }

    pub fn secret_key(&self) -> &SecretKey {
        self.wire.keypair.secret()
    }

    /// What others need to send us a friend request.
    pub fn address(&self) -> Address {
        Address::new(self.public_key(), self.nospam)
    }

    pub fn nospam(&self) -> u32 {
        self.nospam
    }

    /// Change the nospam; requests to the old address are dropped.
    pub fn set_nospam(&mut self, nospam: u32) {
        self.nospam = nospam;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), SetInfoError> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(SetInfoError::TooLong);
        }
        self.name = name.to_owned();
        self.send_to_connected(&Packet::Name(self.name.clone()));
        let actions = self.groups.set_name(self.name.clone());
        self.run_group_actions(actions);
        Ok(())
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn set_status_message(&mut self, status_message: &str) -> Result<(), SetInfoError> {
        if status_message.len() > MAX_STATUS_MESSAGE_LENGTH {
            return Err(SetInfoError::TooLong);
        }
        self.status_message = status_message.to_owned();
        self.send_to_connected(&Packet::StatusMessage(self.status_message.clone()));
        Ok(())
    }

    fn send_to_connected(&mut self, packet: &Packet) {
        let now = self.clock;
        for (_, friend) in self.friends.iter_mut() {
            if !friend.conn.is_connected() {
                continue;
            }
            if let Err(e) = send_to(friend, &mut self.wire, packet, now) {
                debug!(peer = %friend.public_key.fmt_short(), "profile update not sent: {e}");
            }
        }
    }

    // ── Network ──────────────────────────────────────────────────────────

    /// Seed the DHT.
    pub fn bootstrap(&mut self, addr: SocketAddr, public_key: PublicKey) {
        self.wire.dht.bootstrap(addr, public_key);
    }

    /// Returns false if the relay was already known.
    pub fn add_relay(&mut self, relay: RelayAddr) -> bool {
        self.wire.relays.add_relay(relay)
    }

    /// Relay links currently up.
    pub fn relay_count(&self) -> usize {
        self.wire.relays.connected_count()
    }

    /// As of the last iteration.
    pub fn self_connection_status(&self) -> SelfConnectionStatus {
        self.self_status
    }

    fn update_self_status(&mut self) {
        let status = if self.wire.udp_enabled && self.wire.dht.is_connected() {
            SelfConnectionStatus::Udp
        } else if self.wire.relays.connected_count() > 0 {
            SelfConnectionStatus::Tcp
        } else {
            SelfConnectionStatus::None
        };
        if status == self.self_status {
            return;
        }
        info!(from = %self.self_status, to = %status, "self connection status");
        self.self_status = status;
        self.events.push(Event::SelfConnectionStatus { status });
    }

    // ── Friends ──────────────────────────────────────────────────────────

    fn insert_friend(
        &mut self,
        public_key: PublicKey,
        request: Option<RequestBody>,
    ) -> Result<FriendId, FriendAddError> {
        if public_key == self.public_key() {
            return Err(FriendAddError::OwnKey);
        }
        if self.by_key.contains_key(&public_key) {
            return Err(FriendAddError::AlreadyExists);
        }
        let handle = self
            .friends
            .try_insert(Friend::new(public_key, request))
            .map_err(|_| FriendAddError::TooManyFriends)?;
        let id = FriendId(handle);
        self.by_key.insert(public_key, id);
        info!(friend = %id, peer = %public_key.fmt_short(), "friend added");
        Ok(id)
    }

    /// Add a friend without sending a request, typically to accept one.
    pub fn add_friend(&mut self, public_key: PublicKey) -> Result<FriendId, FriendAddError> {
        self.insert_friend(public_key, None)
    }

    /// Add a friend and keep asking them with `message` until they accept.
    pub fn add_friend_by_address(
        &mut self,
        address: &Address,
        message: &str,
    ) -> Result<FriendId, FriendAddError> {
        if message.len() > MAX_FRIEND_REQUEST_LENGTH {
            return Err(FriendAddError::TooLong);
        }
        if message.is_empty() {
            return Err(FriendAddError::NoMessage);
        }
        if address.public_key() == self.public_key() {
            return Err(FriendAddError::OwnKey);
        }
        if !address.is_valid() {
            return Err(FriendAddError::BadChecksum);
        }
        let request = RequestBody {
            nospam: address.nospam(),
            message: message.to_owned(),
        };
        self.insert_friend(address.public_key(), Some(request))
    }

    /// Drop a friend at once. The peer sees us go offline.
    pub fn remove_friend(&mut self, friend: FriendId) -> Result<(), FriendError> {
        let mut removed = self.friends.remove(friend.0).ok_or(FriendError::NotFound)?;
        removed.conn.close(&mut self.wire);
        self.by_key.remove(&removed.public_key);
        self.groups.on_friend_offline(friend);
        info!(%friend, peer = %removed.public_key.fmt_short(), "friend removed");
        Ok(())
    }

    fn friend(&self, friend: FriendId) -> Result<&Friend, FriendError> {
        self.friends.get(friend.0).ok_or(FriendError::NotFound)
    }

    pub fn friends(&self) -> Vec<FriendId> {
        self.friends.handles().into_iter().map(FriendId).collect()
    }

    pub fn friend_by_public_key(&self, public_key: &PublicKey) -> Option<FriendId> {
        self.by_key.get(public_key).copied()
    }

    pub fn friend_public_key(&self, friend: FriendId) -> Result<PublicKey, FriendError> {
        Ok(self.friend(friend)?.public_key)
    }

    pub fn friend_connection_status(&self, friend: FriendId) -> Result<ConnectionStatus, FriendError> {
        Ok(self.friend(friend)?.conn.status())
    }

    pub fn friend_name(&self, friend: FriendId) -> Result<&str, FriendError> {
        Ok(&self.friend(friend)?.name)
    }

    pub fn friend_status_message(&self, friend: FriendId) -> Result<&str, FriendError> {
        Ok(&self.friend(friend)?.status_message)
    }

    pub fn friend_typing(&self, friend: FriendId) -> Result<bool, FriendError> {
        Ok(self.friend(friend)?.typing)
    }

    /// Milliseconds timestamp of the last time the friend was connected.
    pub fn friend_last_seen(&self, friend: FriendId) -> Result<u64, FriendError> {
        Ok(self.friend(friend)?.last_seen)
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Returns the message id.
    pub fn send_message(
        &mut self,
        friend: FriendId,
        kind: MessageKind,
        text: &str,
    ) -> Result<u32, SendPacketError> {
        let now = self.clock;
        let f = self.friends.get_mut(friend.0).ok_or(SendPacketError::NotFound)?;
        if text.is_empty() {
            return Err(SendPacketError::Empty);
        }
        if text.len() > MAX_MESSAGE_LENGTH {
            return Err(SendPacketError::TooLong);
        }
        let packet = Packet::Message {
            kind,
            text: text.to_owned(),
        };
        send_to(f, &mut self.wire, &packet, now)?;
        Ok(f.take_message_id())
    }

    /// Remembered while offline and sent on connect.
    pub fn set_typing(&mut self, friend: FriendId, typing: bool) -> Result<(), FriendError> {
        let now = self.clock;
        let f = self.friends.get_mut(friend.0).ok_or(FriendError::NotFound)?;
        if f.our_typing == typing {
            return Ok(());
        }
        f.our_typing = typing;
        if f.conn.is_connected() {
            if let Err(e) = send_to(f, &mut self.wire, &Packet::Typing(typing), now) {
                debug!(%friend, "typing not sent: {e}");
            }
        }
        Ok(())
    }

    fn send_custom(&mut self, friend: FriendId, packet: Packet) -> Result<(), SendPacketError> {
        let now = self.clock;
        let f = self.friends.get_mut(friend.0).ok_or(SendPacketError::NotFound)?;
        let (Packet::CustomLossless(data) | Packet::CustomLossy(data)) = &packet else {
            return Err(SendPacketError::Empty);
        };
        if data.is_empty() {
            return Err(SendPacketError::Empty);
        }
        if data.len() > MAX_CUSTOM_PACKET_SIZE {
            return Err(SendPacketError::TooLong);
        }
        send_to(f, &mut self.wire, &packet, now)
    }

    /// Opaque application data, delivered reliably and in order.
    pub fn send_lossless_packet(&mut self, friend: FriendId, data: &[u8]) -> Result<(), SendPacketError> {
        self.send_custom(friend, Packet::CustomLossless(data.to_vec()))
    }

    /// Opaque application data, best effort.
    pub fn send_lossy_packet(&mut self, friend: FriendId, data: &[u8]) -> Result<(), SendPacketError> {
        self.send_custom(friend, Packet::CustomLossy(data.to_vec()))
    }

    // ── Files ────────────────────────────────────────────────────────────

    fn run_file_actions(&mut self, friend: FriendId, actions: Vec<FileAction>, now: u64) {
        for action in actions {
            match action {
                FileAction::Send(packet) => {
                    let Some(f) = self.friends.get_mut(friend.0) else {
                        continue;
                    };
                    if let Err(e) = send_to(f, &mut self.wire, &packet, now) {
                        debug!(%friend, tag = packet.tag(), "file packet not sent: {e}");
                    }
                }
                FileAction::Event(event) => self.events.push(event),
                FileAction::Rejected { transfer, error } => {
                    warn!(%friend, %transfer, "file packet rejected: {error}");
                }
            }
        }
    }

    /// Announce a file. A missing `file_id` is made up.
    pub fn file_send(
        &mut self,
        friend: FriendId,
        kind: FileKind,
        size: u64,
        file_id: Option<FileId>,
        filename: &str,
    ) -> Result<TransferId, FileSendError> {
        let now = self.clock;
        let f = self.friends.get_mut(friend.0).ok_or(FileSendError::NotFound)?;
        if !f.conn.is_connected() {
            return Err(FileSendError::NotConnected);
        }
        if f.conn.free_slots() == 0 {
            return Err(FileSendError::SendQueueFull);
        }
        let file_id = file_id.unwrap_or_else(FileId::random);
        let (transfer, actions) = f.transfers.send(kind, size, file_id, filename.to_owned())?;
        info!(%friend, %transfer, size, "sending file");
        self.run_file_actions(friend, actions, now);
        Ok(transfer)
    }

    /// Look up a connected friend with send queue room.
    fn ready_transfers(&mut self, friend: FriendId) -> Result<&mut FileTransfers, ReadyError> {
        let f = self.friends.get_mut(friend.0).ok_or(ReadyError::NotFound)?;
        if !f.conn.is_connected() {
            return Err(ReadyError::NotConnected);
        }
        if f.conn.free_slots() == 0 {
            return Err(ReadyError::QueueFull);
        }
        Ok(&mut f.transfers)
    }

    pub fn file_control(
        &mut self,
        friend: FriendId,
        transfer: TransferId,
        control: FileControl,
    ) -> Result<(), FileControlError> {
        let now = self.clock;
        let actions = self
            .ready_transfers(friend)
            .map_err(|e| e.pick(FileControlError::FriendNotFound, FileControlError::NotConnected, FileControlError::SendQueueFull))?
            .control(transfer, control)?;
        self.run_file_actions(friend, actions, now);
        Ok(())
    }

    /// Only before the transfer is resumed.
    pub fn file_seek(
        &mut self,
        friend: FriendId,
        transfer: TransferId,
        position: u64,
    ) -> Result<(), FileSeekError> {
        let now = self.clock;
        let actions = self
            .ready_transfers(friend)
            .map_err(|e| e.pick(FileSeekError::FriendNotFound, FileSeekError::NotConnected, FileSeekError::SendQueueFull))?
            .seek(transfer, position)?;
        self.run_file_actions(friend, actions, now);
        Ok(())
    }

    /// Answer the oldest chunk request of an outgoing transfer.
    pub fn file_send_chunk(
        &mut self,
        friend: FriendId,
        transfer: TransferId,
        position: u64,
        data: &[u8],
    ) -> Result<(), FileChunkError> {
        let now = self.clock;
        let actions = self
            .ready_transfers(friend)
            .map_err(|e| e.pick(FileChunkError::FriendNotFound, FileChunkError::NotConnected, FileChunkError::SendQueueFull))?
            .send_chunk(transfer, position, data.to_vec())?;
        self.run_file_actions(friend, actions, now);
        Ok(())
    }

    fn transfer(&self, friend: FriendId, transfer: TransferId) -> Result<&crate::file::Transfer, FileQueryError> {
        self.friends
            .get(friend.0)
            .ok_or(FileQueryError::FriendNotFound)?
            .transfers
            .get(transfer)
            .ok_or(FileQueryError::NotFound)
    }

    pub fn file_id(&self, friend: FriendId, transfer: TransferId) -> Result<FileId, FileQueryError> {
        Ok(self.transfer(friend, transfer)?.file_id)
    }

    /// Bytes sent or received so far.
    pub fn file_position(&self, friend: FriendId, transfer: TransferId) -> Result<u64, FileQueryError> {
        Ok(self.transfer(friend, transfer)?.position)
    }

    pub fn file_state(&self, friend: FriendId, transfer: TransferId) -> Result<TransferState, FileQueryError> {
        Ok(self.transfer(friend, transfer)?.state())
    }

    /// Transfers broken by disconnects, latest per file id.
    pub fn resume_points(&self, friend: FriendId) -> Result<&[ResumePoint], FriendError> {
        Ok(&self.friend(friend)?.resume_points)
    }

    /// Forget resume points once the host has dealt with them.
    pub fn clear_resume_points(&mut self, friend: FriendId) -> Result<(), FriendError> {
        self.friends
            .get_mut(friend.0)
            .ok_or(FriendError::NotFound)?
            .resume_points
            .clear();
        Ok(())
    }

    // ── Groups ───────────────────────────────────────────────────────────

    fn run_group_actions(&mut self, actions: Vec<GroupAction>) {
        let now = self.clock;
        for action in actions {
            match action {
                GroupAction::Send { friend, packet } => {
                    let Some(f) = self.friends.get_mut(friend.0) else {
                        continue;
                    };
                    if let Err(e) = send_to(f, &mut self.wire, &packet, now) {
                        debug!(%friend, tag = packet.tag(), "group packet not sent: {e}");
                    }
                }
                GroupAction::Event(event) => self.events.push(event),
            }
        }
    }

    fn connected_friend(&self, friend: FriendId) -> Result<(), GroupError> {
        let f = self.friends.get(friend.0).ok_or(GroupError::FriendNotFound)?;
        if !f.conn.is_connected() {
            return Err(GroupError::NotConnected);
        }
        Ok(())
    }

    pub fn create_group(&mut self) -> Result<GroupNumber, GroupError> {
        self.groups.create(self.clock)
    }

    pub fn group_invite(&mut self, group: GroupNumber, friend: FriendId) -> Result<(), GroupError> {
        self.connected_friend(friend)?;
        let actions = self.groups.invite(group, friend)?;
        self.run_group_actions(actions);
        Ok(())
    }

    /// Join with a cookie from a `group_invite` event.
    pub fn group_join(&mut self, friend: FriendId, cookie: &[u8]) -> Result<GroupNumber, GroupError> {
        self.connected_friend(friend)?;
        let (number, actions) = self.groups.join(friend, cookie, self.clock)?;
        self.run_group_actions(actions);
        Ok(number)
    }

    pub fn group_send_message(
        &mut self,
        group: GroupNumber,
        kind: MessageKind,
        text: &str,
    ) -> Result<(), GroupError> {
        let actions = self.groups.send_message(group, kind, text.to_owned())?;
        self.run_group_actions(actions);
        Ok(())
    }

    pub fn group_set_title(&mut self, group: GroupNumber, title: &str) -> Result<(), GroupError> {
        let actions = self.groups.set_title(group, title.to_owned())?;
        self.run_group_actions(actions);
        Ok(())
    }

    pub fn group_leave(&mut self, group: GroupNumber) -> Result<(), GroupError> {
        let actions = self.groups.leave(group)?;
        self.run_group_actions(actions);
        Ok(())
    }

    pub fn groups(&self) -> Vec<GroupNumber> {
        self.groups.groups()
    }

    pub fn group_id(&self, group: GroupNumber) -> Result<GroupId, GroupError> {
        self.groups.group_id(group)
    }

    pub fn group_title(&self, group: GroupNumber) -> Result<String, GroupError> {
        self.groups.title(group)
    }

    /// Members including ourselves.
    pub fn group_peer_count(&self, group: GroupNumber) -> Result<usize, GroupError> {
        self.groups.peer_count(group)
    }

    pub fn group_peers(&self, group: GroupNumber) -> Result<Vec<GroupPeer>, GroupError> {
        self.groups.peers(group)
    }

    pub fn group_peer_public_key(
        &self,
        group: GroupNumber,
        peer: PeerNumber,
    ) -> Result<PublicKey, GroupError> {
        self.groups.peer_public_key(group, peer)
    }

    // ── Iteration ────────────────────────────────────────────────────────

    /// Suggested delay before the next [`iterate`](Self::iterate).
    pub fn iteration_interval(&self) -> Duration {
        let busy = self
            .friends
            .iter()
            .any(|(_, f)| f.transfers.has_running());
        if busy {
            BUSY_INTERVAL
        } else {
            IDLE_INTERVAL
        }
    }

    /// One tick on the wall clock.
    pub fn iterate(&mut self, sink: &mut dyn EventSink) {
        self.iterate_at(now_ms(), sink);
    }

    /// One tick at `now` milliseconds.
    pub fn iterate_at(&mut self, now: u64, sink: &mut dyn EventSink) {
        self.clock = now;

        while let Some((from, bytes)) = self.wire.transport.poll_udp() {
            if self.wire.udp_enabled {
                self.handle_datagram(Path::Direct(from), &bytes, now);
            }
        }
        while let Some((from, bytes)) = self.wire.transport.poll_relay() {
            let events = self
                .wire
                .relays
                .handle_frame(from, &bytes, now, self.wire.transport.as_mut());
            self.on_relay_events(events, now);
        }
        let events = self.wire.relays.tick(now, self.wire.transport.as_mut());
        self.on_relay_events(events, now);
        self.update_self_status();

        for handle in self.friends.handles() {
            let Some(friend) = self.friends.get_mut(handle) else {
                continue;
            };
            let events = friend.conn.tick(now, &mut self.wire);
            if friend.conn.is_connected() {
                friend.last_seen = now;
            }
            self.on_conn_events(FriendId(handle), events, now);
        }

        let window = self.wire.timing.file_request_window;
        for handle in self.friends.handles() {
            let Some(friend) = self.friends.get_mut(handle) else {
                continue;
            };
            if !friend.conn.is_connected() {
                continue;
            }
            let actions = friend.transfers.tick(window, friend.conn.free_slots());
            self.run_file_actions(FriendId(handle), actions, now);
        }

        let actions = self.groups.tick(now);
        self.run_group_actions(actions);

        for (_, friend) in self.friends.iter_mut() {
            friend.conn.flush(now, &mut self.wire);
        }

        for event in std::mem::take(&mut self.events) {
            sink.event(event);
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    fn on_relay_events(&mut self, events: Vec<RelayEvent>, now: u64) {
        for event in events {
            match event {
                RelayEvent::Data { peer, payload, .. } => match wire::parse(&payload) {
                    Some(datagram) if datagram.sender() == peer => {
                        self.handle_datagram(Path::Relay, &payload, now);
                    }
                    _ => debug!(peer = %peer.fmt_short(), "relayed datagram with wrong sender dropped"),
                },
                other => debug!(event = ?other, "relay event"),
            }
        }
    }

    fn handle_datagram(&mut self, path: Path, bytes: &[u8], now: u64) {
        let Some(datagram) = wire::parse(bytes) else {
            debug!(len = bytes.len(), "unparseable datagram dropped");
            return;
        };
        match datagram {
            wire::Datagram::Handshake {
                sender,
                nonce,
                sealed,
            } => {
                let body = match wire::open_handshake(self.wire.keypair.secret(), &sender, &nonce, sealed) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(peer = %sender.fmt_short(), "handshake rejected: {e}");
                        return;
                    }
                };
                let Some(id) = self.by_key.get(&sender).copied() else {
                    self.on_stranger(sender, body.request);
                    return;
                };
                let Some(friend) = self.friends.get_mut(id.0) else {
                    return;
                };
                let events = friend.conn.on_handshake(body, path, now, &mut self.wire);
                self.on_conn_events(id, events, now);
            }
            wire::Datagram::Data { sender, packet } => {
                let Some(id) = self.by_key.get(&sender).copied() else {
                    debug!(peer = %sender.fmt_short(), "data from stranger dropped");
                    return;
                };
                let Some(friend) = self.friends.get_mut(id.0) else {
                    return;
                };
                let events = friend.conn.on_data(packet, now);
                self.on_conn_events(id, events, now);
            }
        }
    }

    fn on_stranger(&mut self, sender: PublicKey, request: Option<RequestBody>) {
        let Some(request) = request else {
            debug!(peer = %sender.fmt_short(), "handshake from stranger dropped");
            return;
        };
        if request.nospam != self.nospam {
            debug!(peer = %sender.fmt_short(), "friend request with stale nospam dropped");
            return;
        }
        if request.message.is_empty() || request.message.len() > MAX_FRIEND_REQUEST_LENGTH {
            debug!(peer = %sender.fmt_short(), "friend request with bad message dropped");
            return;
        }
        if self.seen_requests.put(sender, ()).is_some() {
            return;
        }
        info!(peer = %sender.fmt_short(), "friend request");
        self.events.push(Event::FriendRequest {
            public_key: sender,
            message: request.message,
        });
    }

    fn on_conn_events(&mut self, friend: FriendId, events: Vec<ConnEvent>, now: u64) {
        for event in events {
            match event {
                ConnEvent::Status(status) => {
                    self.events.push(Event::ConnectionStatus { friend, status });
                    if status.is_connected() {
                        self.on_online(friend, now);
                    } else if status == ConnectionStatus::None {
                        self.on_offline(friend, now);
                    }
                }
                ConnEvent::Packet(bytes) => self.on_packet(friend, &bytes, now),
            }
        }
    }

    fn on_online(&mut self, friend: FriendId, now: u64) {
        let Some(f) = self.friends.get_mut(friend.0) else {
            return;
        };
        f.last_seen = now;
        let mut hello = Vec::new();
        if !self.name.is_empty() {
            hello.push(Packet::Name(self.name.clone()));
        }
        if !self.status_message.is_empty() {
            hello.push(Packet::StatusMessage(self.status_message.clone()));
        }
        if f.our_typing {
            hello.push(Packet::Typing(true));
        }
        for packet in &hello {
            if let Err(e) = send_to(f, &mut self.wire, packet, now) {
                debug!(%friend, "profile not sent: {e}");
            }
        }
        let public_key = f.public_key;
        let roster = Roster {
            friends: &self.friends,
            by_key: &self.by_key,
        };
        let actions = self.groups.on_friend_online(&public_key, &roster);
        self.run_group_actions(actions);
    }

    fn on_offline(&mut self, friend: FriendId, now: u64) {
        let Some(f) = self.friends.get_mut(friend.0) else {
            return;
        };
        f.last_seen = now;
        f.typing = false;
        let (points, actions) = f.transfers.break_all(friend);
        for point in points {
            f.resume_points
                .retain(|p| p.direction != point.direction || p.file_id != point.file_id);
            f.resume_points.push(point);
        }
        self.groups.on_friend_offline(friend);
        self.run_file_actions(friend, actions, now);
    }

    fn with_transfers(
        &mut self,
        friend: FriendId,
        now: u64,
        op: impl FnOnce(&mut FileTransfers) -> Vec<FileAction>,
    ) {
        let Some(f) = self.friends.get_mut(friend.0) else {
            return;
        };
        let actions = op(&mut f.transfers);
        self.run_file_actions(friend, actions, now);
    }

    fn on_packet(&mut self, friend: FriendId, bytes: &[u8], now: u64) {
        let packet = match Packet::decode(bytes) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!(%friend, tag = ?bytes.first(), "unknown packet type dropped");
                return;
            }
            Err(e) => {
                debug!(%friend, "malformed packet dropped: {e}");
                return;
            }
        };
        match packet {
            Packet::Ping => {}
            Packet::Kill => {
                let Some(f) = self.friends.get_mut(friend.0) else {
                    return;
                };
                info!(%friend, "peer closed the connection");
                let events = f.conn.go_offline();
                self.on_conn_events(friend, events, now);
            }
            Packet::Name(name) => {
                if let Some(f) = self.friends.get_mut(friend.0) {
                    f.name = name.clone();
                }
                self.events.push(Event::FriendName { friend, name });
            }
            Packet::StatusMessage(status_message) => {
                if let Some(f) = self.friends.get_mut(friend.0) {
                    f.status_message = status_message.clone();
                }
                self.events.push(Event::FriendStatusMessage {
                    friend,
                    status_message,
                });
            }
            Packet::Typing(typing) => {
                if let Some(f) = self.friends.get_mut(friend.0) {
                    f.typing = typing;
                }
                self.events.push(Event::FriendTyping { friend, typing });
            }
            Packet::Message { kind, text } => {
                self.events.push(Event::FriendMessage { friend, kind, text });
            }
            Packet::FileAnnounce(announce) => {
                self.with_transfers(friend, now, |t| t.handle_announce(friend, announce));
            }
            Packet::FileControl(control) => {
                self.with_transfers(friend, now, |t| t.handle_control(friend, control));
            }
            Packet::FileChunkRequest {
                number,
                position,
                length,
            } => {
                self.with_transfers(friend, now, |t| t.handle_request(friend, number, position, length));
            }
            Packet::FileChunkData {
                number,
                position,
                data,
            } => {
                self.with_transfers(friend, now, |t| t.handle_data(friend, number, position, data));
            }
            Packet::GroupInvite(invite) => {
                let actions = self.groups.handle_invite(friend, invite);
                self.run_group_actions(actions);
            }
            Packet::GroupSync(sync) => {
                let roster = Roster {
                    friends: &self.friends,
                    by_key: &self.by_key,
                };
                let actions = self.groups.handle_sync(friend, sync, now, &roster);
                self.run_group_actions(actions);
            }
            Packet::GroupMessage(broadcast) => {
                let roster = Roster {
                    friends: &self.friends,
                    by_key: &self.by_key,
                };
                let actions = self.groups.handle_broadcast(friend, broadcast, now, &roster);
                self.run_group_actions(actions);
            }
            Packet::CustomLossless(data) => {
                self.events.push(Event::LosslessPacket { friend, data });
            }
            Packet::CustomLossy(data) => {
                self.events.push(Event::LossyPacket { friend, data });
            }
        }
    }
}

/// Shared precondition failures of the file operations.
#[derive(Debug, Clone, Copy)]
enum ReadyError {
    NotFound,
    NotConnected,
    QueueFull,
}

impl ReadyError {
    fn pick<E>(self, not_found: E, not_connected: E, queue_full: E) -> E {
        match self {
            Self::NotFound => not_found,
            Self::NotConnected => not_connected,
            Self::QueueFull => queue_full,
        }
    }
}
