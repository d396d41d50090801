/// RelayClient — client side of the relay links.
///
/// Pure state machine driven by `handle_frame` and `tick`; frames go out
/// through the [`Transport`] passed in. Keeps one link per configured
/// relay and re-requests every wanted route whenever a link comes up.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tracing::{debug, info};

use super::{ConnId, RelayAddr, RelayFrame};
use crate::{PublicKey, RelayError, Transport};

/// Resend `Hello` this often until the server answers.
pub const HELLO_RETRY_MS: u64 = 1_000;
/// Ping an idle link this often.
pub const PING_INTERVAL_MS: u64 = 10_000;
/// Declare a link down after this long without any frame.
pub const LINK_TIMEOUT_MS: u64 = 30_000;

/// Something the friend layer should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    LinkUp(SocketAddr),
    LinkDown(SocketAddr),
    PeerOnline { relay: SocketAddr, peer: PublicKey },
    PeerOffline { relay: SocketAddr, peer: PublicKey },
    Data {
        relay: SocketAddr,
        peer: PublicKey,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
}

#[derive(Debug)]
struct Route {
    peer: PublicKey,
    online: bool,
}

#[derive(Debug)]
struct Link {
    relay: RelayAddr,
    state: LinkState,
    last_hello: Option<u64>,
    last_recv: u64,
    last_ping: u64,
    next_nonce: u64,
    routes: HashMap<ConnId, Route>,
}

impl Link {
    fn new(relay: RelayAddr) -> Self {
        Self {
            relay,
            state: LinkState::Connecting,
            last_hello: None,
            last_recv: 0,
            last_ping: 0,
            next_nonce: 0,
            routes: HashMap::new(),
        }
    }

    fn conn_for(&self, peer: &PublicKey) -> Option<ConnId> {
        self.routes
            .iter()
            .find(|(_, route)| route.peer == *peer)
            .map(|(id, _)| *id)
    }

    fn send(&self, frame: &RelayFrame, transport: &mut dyn Transport) {
        let bytes = match frame.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(relay = %self.relay.addr, "relay frame encode failed: {e}");
                return;
            }
        };
        if let Err(e) = transport.send_relay(self.relay.addr, &bytes) {
            debug!(relay = %self.relay.addr, "relay send failed: {e}");
        }
    }
}

/// Client side of all relay links.
pub struct RelayClient {
    local: PublicKey,
    links: Vec<Link>,
    /// Peers we want routes to on every link.
    wanted: HashSet<PublicKey>,
}

impl RelayClient {
    pub fn new(local: PublicKey) -> Self {
        Self {
            local,
            links: Vec::new(),
            wanted: HashSet::new(),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────

    /// Add a relay. Returns `false` if it was already configured.
    pub fn add_relay(&mut self, relay: RelayAddr) -> bool {
        if self.links.iter().any(|l| l.relay.addr == relay.addr) {
            return false;
        }
        self.links.push(Link::new(relay));
        true
    }

    pub fn relays(&self) -> Vec<RelayAddr> {
        self.links.iter().map(|l| l.relay).collect()
    }

    /// Number of links that completed the hello exchange.
    pub fn connected_count(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Connected)
            .count()
    }

    // ── Routes ───────────────────────────────────────────────────────────

    /// Ask every connected relay for a route to `peer`. Idempotent.
    pub fn request_route(&mut self, peer: PublicKey, transport: &mut dyn Transport) {
        if !self.wanted.insert(peer) {
            return;
        }
        for link in &self.links {
            if link.state == LinkState::Connected && link.conn_for(&peer).is_none() {
                link.send(&RelayFrame::RouteRequest { peer }, transport);
            }
        }
    }

    /// Drop every route to `peer`.
    pub fn remove_route(&mut self, peer: &PublicKey, transport: &mut dyn Transport) {
        self.wanted.remove(peer);
        for link in &mut self.links {
            if let Some(conn_id) = link.conn_for(peer) {
                link.routes.remove(&conn_id);
                link.send(&RelayFrame::Disconnected { conn_id }, transport);
            }
        }
    }

    /// Whether any link currently has an online route to `peer`.
    pub fn is_online(&self, peer: &PublicKey) -> bool {
        self.links.iter().any(|l| {
            l.state == LinkState::Connected
                && l.routes.values().any(|r| r.peer == *peer && r.online)
        })
    }

    /// Send `payload` to `peer` over the first link with an online route.
    pub fn send(
        &mut self,
        peer: &PublicKey,
        payload: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), RelayError> {
        for link in &self.links {
            if link.state != LinkState::Connected {
                continue;
            }
            let Some((conn_id, _)) = link
                .routes
                .iter()
                .find(|(_, r)| r.peer == *peer && r.online)
            else {
                continue;
            };
            let frame = RelayFrame::Data {
                conn_id: *conn_id,
                payload: payload.to_vec(),
            };
            link.send(&frame, transport);
            return Ok(());
        }
        Err(RelayError::NoRoute(*peer))
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Process one frame received from `from`.
    pub fn handle_frame(
        &mut self,
        from: SocketAddr,
        bytes: &[u8],
        now: u64,
        transport: &mut dyn Transport,
    ) -> Vec<RelayEvent> {
        let Some(index) = self.links.iter().position(|l| l.relay.addr == from) else {
            debug!(relay = %from, "frame from unknown relay dropped");
            return Vec::new();
        };
        let frame = match RelayFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(relay = %from, "undecodable relay frame dropped: {e}");
                return Vec::new();
            }
        };

        let wanted: Vec<PublicKey> = self.wanted.iter().copied().collect();
        let link = &mut self.links[index];
        link.last_recv = now;
        let mut events = Vec::new();

        match frame {
            RelayFrame::Welcome => {
                if link.state == LinkState::Connecting {
                    link.state = LinkState::Connected;
                    link.last_ping = now;
                    info!(relay = %from, "relay link up");
                    events.push(RelayEvent::LinkUp(from));
                    for peer in wanted {
                        link.send(&RelayFrame::RouteRequest { peer }, transport);
                    }
                }
            }
            RelayFrame::RouteResponse { conn_id, peer } => {
                if !self.wanted.contains(&peer) {
                    link.send(&RelayFrame::Disconnected { conn_id }, transport);
                } else {
                    if let Some(old) = link.conn_for(&peer) {
                        link.routes.remove(&old);
                    }
                    link.routes.insert(conn_id, Route { peer, online: false });
                }
            }
            RelayFrame::RouteRejected { peer } => {
                debug!(relay = %from, peer = %peer.fmt_short(), "relay refused route");
            }
            RelayFrame::Connected { conn_id } => {
                if let Some(route) = link.routes.get_mut(&conn_id) {
                    if !route.online {
                        route.online = true;
                        events.push(RelayEvent::PeerOnline {
                            relay: from,
                            peer: route.peer,
                        });
                    }
                }
            }
            RelayFrame::Disconnected { conn_id } => {
                if let Some(route) = link.routes.get_mut(&conn_id) {
                    if route.online {
                        route.online = false;
                        events.push(RelayEvent::PeerOffline {
                            relay: from,
                            peer: route.peer,
                        });
                    }
                }
            }
            RelayFrame::Data { conn_id, payload } => match link.routes.get(&conn_id) {
                Some(route) => events.push(RelayEvent::Data {
                    relay: from,
                    peer: route.peer,
                    payload,
                }),
                None => debug!(relay = %from, conn_id, "data on unknown route dropped"),
            },
            RelayFrame::Ping { nonce } => {
                link.send(&RelayFrame::Pong { nonce }, transport);
            }
            RelayFrame::Pong { .. } => {}
            RelayFrame::Hello { .. } | RelayFrame::RouteRequest { .. } => {
                debug!(relay = %from, "client-only frame from relay dropped");
            }
        }
        events
    }

    // ── Timers ───────────────────────────────────────────────────────────

    /// Retry hellos, ping idle links, expire dead ones.
    pub fn tick(&mut self, now: u64, transport: &mut dyn Transport) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        let local = self.local;
        for link in &mut self.links {
            match link.state {
                LinkState::Connecting => {
                    let due = link
                        .last_hello
                        .map_or(true, |t| now.saturating_sub(t) >= HELLO_RETRY_MS);
                    if due {
                        link.last_hello = Some(now);
                        link.send(&RelayFrame::Hello { public_key: local }, transport);
                    }
                }
                LinkState::Connected => {
                    if now.saturating_sub(link.last_recv) >= LINK_TIMEOUT_MS {
                        info!(relay = %link.relay.addr, "relay link timed out");
                        for route in link.routes.values().filter(|r| r.online) {
                            events.push(RelayEvent::PeerOffline {
                                relay: link.relay.addr,
                                peer: route.peer,
                            });
                        }
                        link.routes.clear();
                        link.state = LinkState::Connecting;
                        link.last_hello = None;
                        events.push(RelayEvent::LinkDown(link.relay.addr));
                    } else if now.saturating_sub(link.last_ping) >= PING_INTERVAL_MS {
                        link.last_ping = now;
                        link.next_nonce = link.next_nonce.wrapping_add(1);
                        link.send(&RelayFrame::Ping { nonce: link.next_nonce }, transport);
                    }
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SecretKey, TransportError};

    /// Records outbound relay frames.
    #[derive(Default)]
    struct Recorder {
        sent: Vec<(SocketAddr, RelayFrame)>,
    }

    impl Transport for Recorder {
        fn send_udp(&mut self, _: SocketAddr, _: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::UdpDisabled)
        }
        fn poll_udp(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
            None
        }
        fn send_relay(&mut self, relay: SocketAddr, frame: &[u8]) -> Result<(), TransportError> {
            self.sent.push((relay, RelayFrame::from_bytes(frame).unwrap()));
            Ok(())
        }
        fn poll_relay(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
            None
        }
    }

    fn key(seed: u8) -> PublicKey {
        SecretKey::from_bytes([seed; 32]).public_key()
    }

    fn relay() -> RelayAddr {
        RelayAddr {
            addr: "10.1.0.1:3389".parse().unwrap(),
            public_key: key(99),
        }
    }

    fn frame(f: RelayFrame) -> Vec<u8> {
        f.to_bytes().unwrap()
    }

    fn connected_client(io: &mut Recorder) -> RelayClient {
        let mut client = RelayClient::new(key(1));
        client.add_relay(relay());
        client.tick(0, io);
        client.handle_frame(relay().addr, &frame(RelayFrame::Welcome), 10, io);
        client
    }

    #[test]
    fn hello_is_retried_until_welcome() {
        let mut io = Recorder::default();
        let mut client = RelayClient::new(key(1));
        assert!(client.add_relay(relay()));
        assert!(!client.add_relay(relay()));

        client.tick(0, &mut io);
        client.tick(500, &mut io);
        client.tick(1_000, &mut io);
        let hellos = io
            .sent
            .iter()
            .filter(|(_, f)| matches!(f, RelayFrame::Hello { .. }))
            .count();
        assert_eq!(hellos, 2);

        let events = client.handle_frame(relay().addr, &frame(RelayFrame::Welcome), 1_100, &mut io);
        assert_eq!(events, vec![RelayEvent::LinkUp(relay().addr)]);
        assert_eq!(client.connected_count(), 1);
    }

    #[test]
    fn wanted_routes_requested_on_link_up() {
        let mut io = Recorder::default();
        let mut client = RelayClient::new(key(1));
        client.add_relay(relay());
        client.request_route(key(2), &mut io);
        assert!(io.sent.is_empty());

        client.handle_frame(relay().addr, &frame(RelayFrame::Welcome), 0, &mut io);
        assert!(io
            .sent
            .contains(&(relay().addr, RelayFrame::RouteRequest { peer: key(2) })));
    }

    #[test]
    fn route_goes_online_and_carries_data() {
        let mut io = Recorder::default();
        let mut client = connected_client(&mut io);
        client.request_route(key(2), &mut io);
        assert!(client.send(&key(2), b"x", &mut io).is_err());

        client.handle_frame(relay().addr, &frame(RelayFrame::RouteResponse { conn_id: 7, peer: key(2) }), 20, &mut io);
        let events = client.handle_frame(relay().addr, &frame(RelayFrame::Connected { conn_id: 7 }), 30, &mut io);
        assert_eq!(
            events,
            vec![RelayEvent::PeerOnline {
                relay: relay().addr,
                peer: key(2)
            }]
        );
        assert!(client.is_online(&key(2)));

        client.send(&key(2), b"hello", &mut io).unwrap();
        assert_eq!(
            io.sent.last().unwrap().1,
            RelayFrame::Data {
                conn_id: 7,
                payload: b"hello".to_vec()
            }
        );

        let events = client.handle_frame(
            relay().addr,
            &frame(RelayFrame::Data { conn_id: 7, payload: b"back".to_vec() }),
            40,
            &mut io,
        );
        assert!(matches!(&events[0], RelayEvent::Data { peer, payload, .. } if *peer == key(2) && payload == b"back"));
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut io = Recorder::default();
        let mut client = connected_client(&mut io);
        client.handle_frame(relay().addr, &frame(RelayFrame::Ping { nonce: 42 }), 50, &mut io);
        assert_eq!(io.sent.last().unwrap().1, RelayFrame::Pong { nonce: 42 });
    }

    #[test]
    fn silent_link_times_out_and_reconnects() {
        let mut io = Recorder::default();
        let mut client = connected_client(&mut io);
        client.request_route(key(2), &mut io);
        client.handle_frame(relay().addr, &frame(RelayFrame::RouteResponse { conn_id: 1, peer: key(2) }), 20, &mut io);
        client.handle_frame(relay().addr, &frame(RelayFrame::Connected { conn_id: 1 }), 20, &mut io);

        let events = client.tick(20 + LINK_TIMEOUT_MS, &mut io);
        assert!(events.contains(&RelayEvent::LinkDown(relay().addr)));
        assert!(events.contains(&RelayEvent::PeerOffline {
            relay: relay().addr,
            peer: key(2)
        }));
        assert!(!client.is_online(&key(2)));
        assert_eq!(client.connected_count(), 0);

        client.tick(20 + LINK_TIMEOUT_MS + 1, &mut io);
        assert!(matches!(io.sent.last().unwrap().1, RelayFrame::Hello { .. }));
    }

    #[test]
    fn unknown_relay_and_garbage_are_ignored() {
        let mut io = Recorder::default();
        let mut client = connected_client(&mut io);
        let stranger: SocketAddr = "10.9.9.9:1".parse().unwrap();
        assert!(client.handle_frame(stranger, &frame(RelayFrame::Welcome), 0, &mut io).is_empty());
        assert!(client.handle_frame(relay().addr, &[0xc1], 0, &mut io).is_empty());
    }
}
