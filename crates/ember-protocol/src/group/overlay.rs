/// GroupOverlay — flood broadcast over friend connections.
///
/// Pure decision engine: no I/O. Every operation returns
/// `Vec<GroupAction>` that the node executes. Each member relays what it
/// receives to its other links in the group; `(origin, seq)` pairs are
/// deduplicated per origin with a [`ReplayWindow`], so every item is
/// applied and relayed at most once per member.
use std::collections::{BTreeSet, HashMap};

use ember_transport::ReplayWindow;
use tracing::{debug, info, warn};

use super::types::{
    BroadcastBody, GroupBroadcast, GroupInvite, GroupSync, PeerEntry, TitleVersion,
};
use crate::arena::{Arena, FriendId, GroupNumber};
use crate::config::Timing;
use crate::error::GroupError;
use crate::events::Event;
use crate::packet::Packet;
use crate::types::{
    GroupId, MessageKind, PeerNumber, PublicKey, MAX_GROUPS, MAX_GROUP_MESSAGE_LENGTH,
    MAX_GROUP_TITLE_LENGTH,
};

/// Peer entries per `State` packet.
const STATE_CHUNK: usize = 6;

/// Our own peer number in every group.
pub const SELF_PEER: PeerNumber = 0;

/// Output of the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupAction {
    Send { friend: FriendId, packet: Packet },
    Event(Event),
}

/// What the overlay needs to know about friends.
pub(crate) trait Contacts {
    /// The connected friend with this key.
    fn online(&self, public_key: &PublicKey) -> Option<FriendId>;
    fn public_key(&self, friend: FriendId) -> Option<PublicKey>;
}

/// A group member as seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPeer {
    pub number: PeerNumber,
    pub public_key: PublicKey,
    pub name: String,
}

#[derive(Debug)]
struct Member {
    peer: GroupPeer,
    last_seen: u64,
}

#[derive(Debug)]
struct Group {
    id: GroupId,
    title: String,
    title_version: Option<TitleVersion>,
    /// Ourselves first.
    members: Vec<Member>,
    next_peer: PeerNumber,
    next_seq: u64,
    seen: HashMap<PublicKey, ReplayWindow>,
    /// Friends we relay to and from.
    links: BTreeSet<FriendId>,
    last_ping: u64,
}

impl Group {
    fn new(id: GroupId, title: String, local: PublicKey, name: String, now: u64) -> Self {
        Self {
            id,
            title,
            title_version: None,
            members: vec![Member {
                peer: GroupPeer {
                    number: SELF_PEER,
                    public_key: local,
                    name,
                },
                last_seen: now,
            }],
            next_peer: SELF_PEER + 1,
            // Survives leave and rejoin without colliding with old seqs.
            next_seq: now,
            seen: HashMap::new(),
            links: BTreeSet::new(),
            last_ping: now,
        }
    }

    fn member(&self, public_key: &PublicKey) -> Option<&Member> {
        self.members.iter().find(|m| m.peer.public_key == *public_key)
    }

    fn member_mut(&mut self, public_key: &PublicKey) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.peer.public_key == *public_key)
    }

    /// Add or refresh a member. Returns its number and whether it is new.
    fn upsert(&mut self, public_key: PublicKey, name: Option<String>, now: u64) -> (PeerNumber, bool) {
        if let Some(member) = self.member_mut(&public_key) {
            if let Some(name) = name {
                member.peer.name = name;
            }
            member.last_seen = now;
            return (member.peer.number, false);
        }
        let number = self.next_peer;
        self.next_peer += 1;
        self.members.push(Member {
            peer: GroupPeer {
                number,
                public_key,
                name: name.unwrap_or_default(),
            },
            last_seen: now,
        });
        (number, true)
    }

    fn remove(&mut self, public_key: &PublicKey) -> bool {
        let before = self.members.len();
        self.members
            .retain(|m| m.peer.number == SELF_PEER || m.peer.public_key != *public_key);
        self.members.len() != before
    }

    fn entries(&self) -> Vec<PeerEntry> {
        self.members
            .iter()
            .map(|m| PeerEntry {
                public_key: m.peer.public_key,
                name: m.peer.name.clone(),
            })
            .collect()
    }
}

pub(crate) struct GroupOverlay {
    local: PublicKey,
    name: String,
    groups: Arena<Group>,
    ping_interval: u64,
    peer_timeout: u64,
}

impl GroupOverlay {
    pub fn new(local: PublicKey, timing: &Timing) -> Self {
        Self {
            local,
            name: String::new(),
            groups: Arena::with_limit(MAX_GROUPS),
            ping_interval: timing.group_ping_interval,
            peer_timeout: timing.group_peer_timeout,
        }
    }

    fn group(&self, number: GroupNumber) -> Result<&Group, GroupError> {
        self.groups.get(number.0).ok_or(GroupError::NotInGroup)
    }

    fn find(&self, id: &GroupId) -> Option<GroupNumber> {
        self.groups
            .iter()
            .find(|(_, g)| g.id == *id)
            .map(|(handle, _)| GroupNumber(handle))
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn groups(&self) -> Vec<GroupNumber> {
        self.groups.handles().into_iter().map(GroupNumber).collect()
    }

    pub fn group_id(&self, number: GroupNumber) -> Result<GroupId, GroupError> {
        Ok(self.group(number)?.id)
    }

    pub fn title(&self, number: GroupNumber) -> Result<String, GroupError> {
        Ok(self.group(number)?.title.clone())
    }

    pub fn peer_count(&self, number: GroupNumber) -> Result<usize, GroupError> {
        Ok(self.group(number)?.members.len())
    }

    pub fn peers(&self, number: GroupNumber) -> Result<Vec<GroupPeer>, GroupError> {
        Ok(self
            .group(number)?
            .members
            .iter()
            .map(|m| m.peer.clone())
            .collect())
    }

    pub fn peer_public_key(
        &self,
        number: GroupNumber,
        peer: PeerNumber,
    ) -> Result<PublicKey, GroupError> {
        self.group(number)?
            .members
            .iter()
            .find(|m| m.peer.number == peer)
            .map(|m| m.peer.public_key)
            .ok_or(GroupError::PeerNotFound)
    }

    // ── Local operations ─────────────────────────────────────────────────

    /// Stamp and send a new item of ours to every link.
    fn flood_own(&mut self, number: GroupNumber, body: BroadcastBody) -> Vec<GroupAction> {
        let local = self.local;
        let Some(group) = self.groups.get_mut(number.0) else {
            return Vec::new();
        };
        let broadcast = GroupBroadcast {
            group_id: group.id,
            origin: local,
            seq: group.next_seq,
            body,
        };
        group.next_seq += 1;
        group
            .links
            .iter()
            .map(|&friend| GroupAction::Send {
                friend,
                packet: Packet::GroupMessage(broadcast.clone()),
            })
            .collect()
    }

    pub fn create(&mut self, now: u64) -> Result<GroupNumber, GroupError> {
        let group = Group::new(GroupId::random(), String::new(), self.local, self.name.clone(), now);
        let id = group.id;
        let handle = self
            .groups
            .try_insert(group)
            .map_err(|_| GroupError::TooManyGroups)?;
        info!(group = %id, "group created");
        Ok(GroupNumber(handle))
    }

    /// The caller checked that `friend` is connected.
    pub fn invite(&self, number: GroupNumber, friend: FriendId) -> Result<Vec<GroupAction>, GroupError> {
        let group = self.group(number)?;
        debug!(group = %group.id, %friend, "inviting friend");
        Ok(vec![GroupAction::Send {
            friend,
            packet: Packet::GroupInvite(GroupInvite {
                group_id: group.id,
                title: group.title.clone(),
            }),
        }])
    }

    /// Accept an invite `friend` sent us.
    pub fn join(
        &mut self,
        friend: FriendId,
        cookie: &[u8],
        now: u64,
    ) -> Result<(GroupNumber, Vec<GroupAction>), GroupError> {
        let invite = GroupInvite::from_cookie(cookie).map_err(|_| GroupError::InviteMalformed)?;
        if self.find(&invite.group_id).is_some() {
            return Err(GroupError::AlreadyInGroup);
        }
        let mut group = Group::new(invite.group_id, invite.title, self.local, self.name.clone(), now);
        group.links.insert(friend);
        let handle = self
            .groups
            .try_insert(group)
            .map_err(|_| GroupError::TooManyGroups)?;
        info!(group = %invite.group_id, %friend, "joining group");
        let join = GroupSync::Join {
            group_id: invite.group_id,
            name: self.name.clone(),
        };
        Ok((
            GroupNumber(handle),
            vec![GroupAction::Send {
                friend,
                packet: Packet::GroupSync(join),
            }],
        ))
    }

    /// Flood a message; our own copy is reported right away.
    pub fn send_message(
        &mut self,
        number: GroupNumber,
        kind: MessageKind,
        text: String,
    ) -> Result<Vec<GroupAction>, GroupError> {
        self.group(number)?;
        if text.is_empty() {
            return Err(GroupError::Empty);
        }
        if text.len() > MAX_GROUP_MESSAGE_LENGTH {
            return Err(GroupError::TooLong);
        }
        let mut actions = self.flood_own(
            number,
            BroadcastBody::Message {
                kind,
                text: text.clone(),
            },
        );
        actions.push(GroupAction::Event(Event::GroupMessage {
            group: number,
            peer: SELF_PEER,
            kind,
            text,
        }));
        Ok(actions)
    }

    pub fn set_title(&mut self, number: GroupNumber, title: String) -> Result<Vec<GroupAction>, GroupError> {
        if title.len() > MAX_GROUP_TITLE_LENGTH {
            return Err(GroupError::TooLong);
        }
        let local = self.local;
        let group = self.groups.get_mut(number.0).ok_or(GroupError::NotInGroup)?;
        let version = TitleVersion {
            counter: group.title_version.map_or(1, |v| v.counter.saturating_add(1)),
            author: local,
        };
        group.title = title.clone();
        group.title_version = Some(version);
        Ok(self.flood_own(number, BroadcastBody::Title { text: title, version }))
    }

    pub fn leave(&mut self, number: GroupNumber) -> Result<Vec<GroupAction>, GroupError> {
        self.group(number)?;
        let actions = self.flood_own(
            number,
            BroadcastBody::PeerLeft {
                public_key: self.local,
            },
        );
        if let Some(group) = self.groups.remove(number.0) {
            info!(group = %group.id, "left group");
        }
        Ok(actions)
    }

    /// Our display name changed; tell every group.
    pub fn set_name(&mut self, name: String) -> Vec<GroupAction> {
        self.name = name.clone();
        let mut actions = Vec::new();
        for number in self.groups() {
            if let Some(group) = self.groups.get_mut(number.0) {
                if let Some(me) = group.members.first_mut() {
                    me.peer.name = name.clone();
                }
            }
            actions.extend(self.flood_own(number, BroadcastBody::PeerName { name: name.clone() }));
        }
        actions
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    pub fn handle_invite(&self, friend: FriendId, invite: GroupInvite) -> Vec<GroupAction> {
        match invite.to_cookie() {
            Ok(cookie) => vec![GroupAction::Event(Event::GroupInvite { friend, cookie })],
            Err(e) => {
                warn!(%friend, "unusable group invite: {e}");
                Vec::new()
            }
        }
    }

    /// Link to every connected friend among `keys` we do not link yet.
    fn link_known(
        group: &mut Group,
        keys: &[PublicKey],
        name: &str,
        contacts: &dyn Contacts,
    ) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        for key in keys {
            let Some(friend) = contacts.online(key) else {
                continue;
            };
            if group.links.insert(friend) {
                debug!(group = %group.id, %friend, "linking fellow member");
                actions.push(GroupAction::Send {
                    friend,
                    packet: Packet::GroupSync(GroupSync::Link {
                        group_id: group.id,
                        name: name.to_owned(),
                    }),
                });
            }
        }
        actions
    }

    pub fn handle_sync(
        &mut self,
        friend: FriendId,
        sync: GroupSync,
        now: u64,
        contacts: &dyn Contacts,
    ) -> Vec<GroupAction> {
        let Some(number) = self.find(&sync.group_id()) else {
            debug!(%friend, group = %sync.group_id(), "sync for unknown group dropped");
            return Vec::new();
        };
        let Some(sender) = contacts.public_key(friend) else {
            return Vec::new();
        };
        let local = self.local;
        let mut actions = Vec::new();
        match sync {
            GroupSync::Join { group_id, name } => {
                let Some(group) = self.groups.get_mut(number.0) else {
                    return actions;
                };
                group.links.insert(friend);
                let (_, added) = group.upsert(sender, Some(name.clone()), now);
                info!(group = %group_id, %friend, "member joined through us");
                for peers in group.entries().chunks(STATE_CHUNK) {
                    actions.push(GroupAction::Send {
                        friend,
                        packet: Packet::GroupSync(GroupSync::State {
                            group_id,
                            title: group.title.clone(),
                            title_version: group.title_version,
                            peers: peers.to_vec(),
                        }),
                    });
                }
                if added {
                    actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
                }
                let joined = self.flood_own(
                    number,
                    BroadcastBody::PeerJoined {
                        public_key: sender,
                        name,
                    },
                );
                actions.extend(joined.into_iter().filter(
                    |a| !matches!(a, GroupAction::Send { friend: to, .. } if *to == friend),
                ));
            }
            GroupSync::State {
                title,
                title_version,
                peers,
                ..
            } => {
                let name = self.name.clone();
                let Some(group) = self.groups.get_mut(number.0) else {
                    return actions;
                };
                group.links.insert(friend);
                if title_version > group.title_version {
                    group.title = title.clone();
                    group.title_version = title_version;
                    let author = title_version.and_then(|v| group.member(&v.author)).map(|m| m.peer.number);
                    actions.push(GroupAction::Event(Event::GroupTitle {
                        group: number,
                        peer: author,
                        title,
                    }));
                }
                let mut changed = false;
                let mut fresh = Vec::new();
                for entry in peers.into_iter().filter(|p| p.public_key != local) {
                    let (_, added) = group.upsert(entry.public_key, Some(entry.name), now);
                    if added {
                        changed = true;
                        if entry.public_key != sender {
                            fresh.push(entry.public_key);
                        }
                    }
                }
                actions.extend(Self::link_known(group, &fresh, &name, contacts));
                if changed {
                    actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
                }
            }
            GroupSync::Link { name, .. } => {
                let Some(group) = self.groups.get_mut(number.0) else {
                    return actions;
                };
                group.links.insert(friend);
                let (_, added) = group.upsert(sender, Some(name), now);
                debug!(group = %group.id, %friend, "fellow member linked");
                if added {
                    actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
                }
            }
        }
        actions
    }

    /// A flooded item arrived from the link `friend`.
    pub fn handle_broadcast(
        &mut self,
        friend: FriendId,
        broadcast: GroupBroadcast,
        now: u64,
        contacts: &dyn Contacts,
    ) -> Vec<GroupAction> {
        let Some(number) = self.find(&broadcast.group_id) else {
            debug!(%friend, group = %broadcast.group_id, "broadcast for unknown group dropped");
            return Vec::new();
        };
        if broadcast.origin == self.local {
            return Vec::new();
        }
        let name = self.name.clone();
        let Some(group) = self.groups.get_mut(number.0) else {
            return Vec::new();
        };
        let fresh = group
            .seen
            .entry(broadcast.origin)
            .or_default()
            .accept(broadcast.seq);
        if !fresh {
            debug!(group = %group.id, origin = %broadcast.origin.fmt_short(), seq = broadcast.seq, "duplicate broadcast dropped");
            return Vec::new();
        }
        group.links.insert(friend);

        let origin = broadcast.origin;
        let mut actions: Vec<GroupAction> = group
            .links
            .iter()
            .filter(|&&link| link != friend && contacts.public_key(link) != Some(origin))
            .map(|&link| GroupAction::Send {
                friend: link,
                packet: Packet::GroupMessage(broadcast.clone()),
            })
            .collect();

        if let BroadcastBody::PeerLeft { public_key } = &broadcast.body {
            if *public_key == origin && group.remove(&origin) {
                info!(group = %group.id, peer = %origin.fmt_short(), "member left");
                if let Some(link) = contacts.online(&origin) {
                    group.links.remove(&link);
                }
                actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
            }
            return actions;
        }

        let (peer, added) = group.upsert(origin, None, now);
        if added {
            actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
        }
        match broadcast.body {
            BroadcastBody::Message { kind, text } => {
                actions.push(GroupAction::Event(Event::GroupMessage {
                    group: number,
                    peer,
                    kind,
                    text,
                }));
            }
            BroadcastBody::Title { text, version } => {
                if Some(version) > group.title_version {
                    group.title = text.clone();
                    group.title_version = Some(version);
                    actions.push(GroupAction::Event(Event::GroupTitle {
                        group: number,
                        peer: Some(peer),
                        title: text,
                    }));
                } else {
                    debug!(group = %group.id, "older title ignored");
                }
            }
            BroadcastBody::PeerJoined { public_key, name: joined_name } => {
                if public_key != self.local {
                    let (_, added) = group.upsert(public_key, Some(joined_name), now);
                    if added {
                        actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
                    }
                    actions.extend(Self::link_known(group, &[public_key], &name, contacts));
                }
            }
            BroadcastBody::PeerName { name: new_name } => {
                if let Some(member) = group.member_mut(&origin) {
                    member.peer.name = new_name.clone();
                }
                actions.push(GroupAction::Event(Event::GroupPeerName {
                    group: number,
                    peer,
                    name: new_name,
                }));
            }
            BroadcastBody::Alive | BroadcastBody::PeerLeft { .. } => {}
        }
        actions
    }

    // ── Friend lifecycle ─────────────────────────────────────────────────

    /// A friend connected: link it in every group it is a member of.
    pub fn on_friend_online(&mut self, public_key: &PublicKey, contacts: &dyn Contacts) -> Vec<GroupAction> {
        let name = self.name.clone();
        let mut actions = Vec::new();
        for (_, group) in self.groups.iter_mut() {
            if group.member(public_key).is_some() {
                actions.extend(Self::link_known(group, &[*public_key], &name, contacts));
            }
        }
        actions
    }

    pub fn on_friend_offline(&mut self, friend: FriendId) {
        for (_, group) in self.groups.iter_mut() {
            if group.links.remove(&friend) {
                debug!(group = %group.id, %friend, "link lost");
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: u64) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        for number in self.groups() {
            let Some(group) = self.groups.get_mut(number.0) else {
                continue;
            };
            let timeout = self.peer_timeout;
            let before = group.members.len();
            group.members.retain(|m| {
                m.peer.number == SELF_PEER || now.saturating_sub(m.last_seen) < timeout
            });
            if group.members.len() != before {
                info!(group = %group.id, dropped = before - group.members.len(), "silent members dropped");
                actions.push(GroupAction::Event(Event::GroupPeerListChanged { group: number }));
            }
            if now.saturating_sub(group.last_ping) >= self.ping_interval {
                group.last_ping = now;
                actions.extend(self.flood_own(number, BroadcastBody::Alive));
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use ember_transport::SecretKey;
    use std::collections::VecDeque;

    const A: usize = 0;
    const B: usize = 1;
    const C: usize = 2;

    fn key(i: usize) -> PublicKey {
        SecretKey::from_bytes([i as u8 + 1; 32]).public_key()
    }

    /// `friend_ids[i][j]` is how member `i` addresses member `j`.
    struct Mesh {
        overlays: Vec<GroupOverlay>,
        friend_ids: Vec<Vec<Option<FriendId>>>,
        online: Vec<Vec<bool>>,
        events: Vec<Vec<Event>>,
        queue: VecDeque<(usize, usize, Packet)>,
    }

    struct View<'a> {
        me: usize,
        mesh_ids: &'a [Vec<Option<FriendId>>],
        online: &'a [Vec<bool>],
    }

    impl Contacts for View<'_> {
        fn online(&self, public_key: &PublicKey) -> Option<FriendId> {
            (0..self.mesh_ids.len())
                .find(|&j| key(j) == *public_key)
                .filter(|&j| self.online[self.me][j])
                .and_then(|j| self.mesh_ids[self.me][j])
        }

        fn public_key(&self, friend: FriendId) -> Option<PublicKey> {
            (0..self.mesh_ids.len())
                .find(|&j| self.mesh_ids[self.me][j] == Some(friend))
                .map(key)
        }
    }

    impl Mesh {
        /// Three members; `friends` lists who is friends with whom.
        fn new(friends: &[(usize, usize)]) -> Self {
            let timing = Timing::from(&NodeConfig::new());
            let mut friend_ids = vec![vec![None; 3]; 3];
            let mut online = vec![vec![false; 3]; 3];
            for i in 0..3 {
                let mut arena: Arena<()> = Arena::with_limit(3);
                for j in 0..3 {
                    let handle = arena.try_insert(()).unwrap();
                    if friends.contains(&(i, j)) || friends.contains(&(j, i)) {
                        friend_ids[i][j] = Some(FriendId(handle));
                        online[i][j] = true;
                    }
                }
            }
            let overlays = (0..3)
                .map(|i| {
                    let mut o = GroupOverlay::new(key(i), &timing);
                    o.name = format!("peer{i}");
                    o
                })
                .collect();
            Self {
                overlays,
                friend_ids,
                online,
                events: vec![Vec::new(); 3],
                queue: VecDeque::new(),
            }
        }

        fn from_id(&self, me: usize, friend: FriendId) -> usize {
            (0..3)
                .find(|&j| self.friend_ids[me][j] == Some(friend))
                .unwrap()
        }

        fn apply(&mut self, me: usize, actions: Vec<GroupAction>) {
            for action in actions {
                match action {
                    GroupAction::Send { friend, packet } => {
                        let to = self.from_id(me, friend);
                        self.queue.push_back((me, to, packet));
                    }
                    GroupAction::Event(e) => self.events[me].push(e),
                }
            }
        }

        fn run(&mut self) {
            while let Some((from, to, packet)) = self.queue.pop_front() {
                let Some(friend) = self.friend_ids[to][from] else {
                    continue;
                };
                let view = View {
                    me: to,
                    mesh_ids: &self.friend_ids,
                    online: &self.online,
                };
                let overlay = &mut self.overlays[to];
                let actions = match packet {
                    Packet::GroupInvite(invite) => overlay.handle_invite(friend, invite),
                    Packet::GroupSync(sync) => overlay.handle_sync(friend, sync, 0, &view),
                    Packet::GroupMessage(b) => overlay.handle_broadcast(friend, b, 0, &view),
                    other => panic!("unexpected {other:?}"),
                };
                self.apply(to, actions);
            }
        }

        fn invite_and_join(&mut self, host: usize, group: GroupNumber, guest: usize) -> GroupNumber {
            let friend = self.friend_ids[host][guest].unwrap();
            let actions = self.overlays[host].invite(group, friend).unwrap();
            self.apply(host, actions);
            self.run();
            let cookie = self.events[guest]
                .iter()
                .rev()
                .find_map(|e| match e {
                    Event::GroupInvite { cookie, .. } => Some(cookie.clone()),
                    _ => None,
                })
                .unwrap();
            let from = self.friend_ids[guest][host].unwrap();
            let (number, actions) = self.overlays[guest].join(from, &cookie, 0).unwrap();
            self.apply(guest, actions);
            self.run();
            number
        }

        fn messages(&self, me: usize) -> Vec<String> {
            self.events[me]
                .iter()
                .filter_map(|e| match e {
                    Event::GroupMessage { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn star() -> (Mesh, [GroupNumber; 3]) {
        let mut mesh = Mesh::new(&[(A, B), (A, C)]);
        let ga = mesh.overlays[A].create(0).unwrap();
        let gb = mesh.invite_and_join(A, ga, B);
        let gc = mesh.invite_and_join(A, ga, C);
        (mesh, [ga, gb, gc])
    }

    #[test]
    fn members_converge_through_the_inviter() {
        let (mesh, groups) = star();
        for (i, g) in groups.iter().enumerate() {
            assert_eq!(mesh.overlays[i].peer_count(*g).unwrap(), 3, "member {i}");
        }
        let names: Vec<_> = mesh.overlays[C]
            .peers(groups[C])
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["peer2", "peer0", "peer1"]);
    }

    #[test]
    fn message_reaches_everyone_exactly_once() {
        let (mut mesh, groups) = star();
        let actions = mesh.overlays[B]
            .send_message(groups[B], MessageKind::Normal, "hello".into())
            .unwrap();
        mesh.apply(B, actions);
        mesh.run();
        assert_eq!(mesh.messages(A), vec!["hello"]);
        assert_eq!(mesh.messages(B), vec!["hello"]);
        assert_eq!(mesh.messages(C), vec!["hello"]);
    }

    #[test]
    fn full_mesh_deduplicates() {
        let mut mesh = Mesh::new(&[(A, B), (A, C), (B, C)]);
        let ga = mesh.overlays[A].create(0).unwrap();
        let gb = mesh.invite_and_join(A, ga, B);
        mesh.invite_and_join(A, ga, C);
        for _ in 0..3 {
            let actions = mesh.overlays[B]
                .send_message(gb, MessageKind::Action, "x".into())
                .unwrap();
            mesh.apply(B, actions);
        }
        mesh.run();
        assert_eq!(mesh.messages(A).len(), 3);
        assert_eq!(mesh.messages(C).len(), 3);
    }

    #[test]
    fn join_twice_and_garbage_cookie() {
        let (mut mesh, groups) = star();
        let friend = mesh.friend_ids[B][A].unwrap();
        let invite = GroupInvite {
            group_id: mesh.overlays[A].group_id(groups[A]).unwrap(),
            title: String::new(),
        };
        let cookie = invite.to_cookie().unwrap();
        assert_eq!(
            mesh.overlays[B].join(friend, &cookie, 0).map(|_| ()),
            Err(GroupError::AlreadyInGroup)
        );
        assert_eq!(
            mesh.overlays[B].join(friend, b"junk", 0).map(|_| ()),
            Err(GroupError::InviteMalformed)
        );
    }

    #[test]
    fn title_last_writer_wins() {
        let (mut mesh, groups) = star();
        let actions = mesh.overlays[B].set_title(groups[B], "first".into()).unwrap();
        mesh.apply(B, actions);
        mesh.run();
        let actions = mesh.overlays[C].set_title(groups[C], "second".into()).unwrap();
        mesh.apply(C, actions);
        mesh.run();
        for (i, g) in groups.iter().enumerate() {
            assert_eq!(mesh.overlays[i].title(*g).unwrap(), "second", "member {i}");
        }
        assert_eq!(
            mesh.overlays[A].set_title(groups[A], "t".repeat(129)).map(|_| ()),
            Err(GroupError::TooLong)
        );
    }

    #[test]
    fn leave_shrinks_the_group_everywhere() {
        let (mut mesh, groups) = star();
        let actions = mesh.overlays[C].leave(groups[C]).unwrap();
        mesh.apply(C, actions);
        mesh.run();
        assert_eq!(mesh.overlays[A].peer_count(groups[A]).unwrap(), 2);
        assert_eq!(mesh.overlays[B].peer_count(groups[B]).unwrap(), 2);
        assert_eq!(mesh.overlays[C].peer_count(groups[C]), Err(GroupError::NotInGroup));
        assert_eq!(
            mesh.overlays[C]
                .send_message(groups[C], MessageKind::Normal, "x".into())
                .map(|_| ()),
            Err(GroupError::NotInGroup)
        );
    }

    #[test]
    fn message_limits() {
        let (mut mesh, groups) = star();
        let o = &mut mesh.overlays[A];
        assert_eq!(
            o.send_message(groups[A], MessageKind::Normal, String::new()).map(|_| ()),
            Err(GroupError::Empty)
        );
        assert_eq!(
            o.send_message(groups[A], MessageKind::Normal, "m".repeat(MAX_GROUP_MESSAGE_LENGTH + 1))
                .map(|_| ()),
            Err(GroupError::TooLong)
        );
        let actions = o
            .send_message(groups[A], MessageKind::Normal, "m".repeat(MAX_GROUP_MESSAGE_LENGTH))
            .unwrap();
        for action in actions {
            if let GroupAction::Send { packet, .. } = action {
                packet.encode().unwrap();
            }
        }
    }

    #[test]
    fn silent_peers_time_out_and_alive_keeps_them() {
        let (mut mesh, groups) = star();
        let timing = Timing::from(&NodeConfig::new());
        let later = timing.group_peer_timeout + 1;
        let actions = mesh.overlays[A].tick(later);
        assert!(actions
            .iter()
            .any(|a| matches!(a, GroupAction::Event(Event::GroupPeerListChanged { .. }))));
        assert!(actions.iter().any(|a| matches!(
            a,
            GroupAction::Send { packet: Packet::GroupMessage(GroupBroadcast { body: BroadcastBody::Alive, .. }), .. }
        )));
        assert_eq!(mesh.overlays[A].peer_count(groups[A]).unwrap(), 1);
        assert_eq!(mesh.overlays[A].peer_public_key(groups[A], SELF_PEER).unwrap(), key(A));
        assert_eq!(
            mesh.overlays[A].peer_public_key(groups[A], 99),
            Err(GroupError::PeerNotFound)
        );
    }

    #[test]
    fn state_is_split_to_fit_packets() {
        let timing = Timing::from(&NodeConfig::new());
        let mut host = GroupOverlay::new(key(0), &timing);
        let g = host.create(0).unwrap();
        let group = host.groups.get_mut(g.0).unwrap();
        for seed in 10..30u8 {
            let pk = SecretKey::from_bytes([seed; 32]).public_key();
            group.upsert(pk, Some("n".repeat(128)), 0);
        }
        let mesh = Mesh::new(&[(A, B)]);
        let friend = mesh.friend_ids[A][B].unwrap();
        let view = View {
            me: A,
            mesh_ids: &mesh.friend_ids,
            online: &mesh.online,
        };
        let id = host.group_id(g).unwrap();
        let actions = host.handle_sync(
            friend,
            GroupSync::Join {
                group_id: id,
                name: "new".into(),
            },
            0,
            &view,
        );
        let states: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                GroupAction::Send { packet: p @ Packet::GroupSync(GroupSync::State { .. }), .. } => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(states.len(), 4);
        for p in states {
            p.encode().unwrap();
        }
    }
}
