/// Per-friend connection state machine.
///
/// Owns at most one secure channel. While connecting it handshakes on
/// every candidate path (DHT-resolved UDP addresses and online relay
/// routes); the path whose handshake derived the live channel is used for
/// the rest of the session. The channel is confirmed, and the status
/// becomes connected, on the first authenticated data packet.
///
/// Status graph: None -> Connecting -> {ConnectedDirect, ConnectedRelay}
/// -> None -> Connecting. A friend never skips Connecting.
use std::net::SocketAddr;

use ember_transport::{
    crypto, Dht, Keypair, PathKind, PublicKey, RelayClient, SecretKey, SecureChannel, Transport,
};
use tracing::{debug, info};

use super::reliable::ReliableLink;
use super::wire::{self, HandshakeBody, RequestBody};
use crate::config::Timing;
use crate::error::SendPacketError;
use crate::packet;
use crate::types::{ConnectionStatus, MAX_PACKET_PAYLOAD};

/// Missed keepalive intervals before a friend is declared offline.
pub const MISSED_KEEPALIVES: u64 = 3;

/// Shared I/O context handed to every connection.
pub(crate) struct Wire {
    pub transport: Box<dyn Transport>,
    pub dht: Box<dyn Dht>,
    pub relays: RelayClient,
    pub keypair: Keypair,
    pub udp_enabled: bool,
    pub timing: Timing,
}

impl Wire {
    fn send(&mut self, peer: &PublicKey, path: &Path, datagram: &[u8]) -> bool {
        match path {
            Path::Direct(addr) => {
                if !self.udp_enabled {
                    return false;
                }
                match self.transport.send_udp(*addr, datagram) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer = %peer.fmt_short(), %addr, "udp send failed: {e}");
                        false
                    }
                }
            }
            Path::Relay => self
                .relays
                .send(peer, datagram, self.transport.as_mut())
                .is_ok(),
        }
    }

    fn secret(&self) -> &SecretKey {
        self.keypair.secret()
    }
}

/// Where a session's traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Path {
    Direct(SocketAddr),
    Relay,
}

impl Path {
    pub fn kind(&self) -> PathKind {
        match self {
            Path::Direct(_) => PathKind::Direct,
            Path::Relay => PathKind::Relay,
        }
    }
}

/// What the connection reports upward, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    Status(ConnectionStatus),
    /// Decrypted application payload, type tag first.
    Packet(Vec<u8>),
}

pub(crate) struct Connection {
    peer: PublicKey,
    status: ConnectionStatus,
    /// Our ephemeral key for the current connection attempt.
    session: SecretKey,
    peer_session: Option<PublicKey>,
    channel: Option<SecureChannel>,
    path: Option<Path>,
    confirmed: bool,
    last_handshake: Option<u64>,
    last_recv: u64,
    last_sent: u64,
    link: ReliableLink,
    /// Friend request attached to our handshakes until the peer answers.
    request: Option<RequestBody>,
}

impl Connection {
    pub fn new(peer: PublicKey, request: Option<RequestBody>) -> Self {
        Self {
            peer,
            status: ConnectionStatus::None,
            session: SecretKey::generate(),
            peer_session: None,
            channel: None,
            path: None,
            confirmed: false,
            last_handshake: None,
            last_recv: 0,
            last_sent: 0,
            link: ReliableLink::new(),
            request,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    pub fn request(&self) -> Option<&RequestBody> {
        self.request.as_ref()
    }

    /// Reliable packets that can still be queued right now.
    pub fn free_slots(&self) -> usize {
        if self.is_connected() {
            self.link.free_slots()
        } else {
            0
        }
    }

    fn set_status(&mut self, status: ConnectionStatus, events: &mut Vec<ConnEvent>) {
        if self.status == status {
            return;
        }
        if self.status == ConnectionStatus::None && status.is_connected() {
            self.status = ConnectionStatus::Connecting;
            events.push(ConnEvent::Status(ConnectionStatus::Connecting));
        }
        info!(peer = %self.peer.fmt_short(), from = %self.status, to = %status, "friend status");
        self.status = status;
        events.push(ConnEvent::Status(status));
    }

    /// Forget the session. Queued packets are dropped.
    fn reset(&mut self) {
        self.session = SecretKey::generate();
        self.peer_session = None;
        self.channel = None;
        self.path = None;
        self.confirmed = false;
        self.last_handshake = None;
        self.link = ReliableLink::new();
    }

    /// Drop the session; a connected friend goes None then Connecting.
    pub fn go_offline(&mut self) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        let was_connected = self.is_connected();
        self.reset();
        if was_connected {
            self.set_status(ConnectionStatus::None, &mut events);
            self.set_status(ConnectionStatus::Connecting, &mut events);
        }
        events
    }

    /// Release everything without reporting. Used on removal.
    pub fn close(&mut self, wire: &mut Wire) {
        if self.is_connected() {
            let kill = self.link.lossy_frame(&[packet::KILL]);
            self.transmit(&kill, 0, wire);
        }
        self.reset();
        self.status = ConnectionStatus::None;
        wire.relays.remove_route(&self.peer, wire.transport.as_mut());
    }

    // ── Timers ───────────────────────────────────────────────────────────

    pub fn tick(&mut self, now: u64, wire: &mut Wire) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        let timing = wire.timing;
        if self.status == ConnectionStatus::None {
            self.set_status(ConnectionStatus::Connecting, &mut events);
        }
        wire.relays.request_route(self.peer, wire.transport.as_mut());

        if self.is_connected() {
            let silent = now.saturating_sub(self.last_recv);
            if silent >= MISSED_KEEPALIVES * timing.keepalive_interval {
                info!(peer = %self.peer.fmt_short(), silent_ms = silent, "friend timed out");
                events.extend(self.go_offline());
            } else {
                self.flush(now, wire);
                if now.saturating_sub(self.last_sent) >= timing.keepalive_interval {
                    let ping = self.link.lossy_frame(&[packet::PING]);
                    self.transmit(&ping, now, wire);
                }
                return events;
            }
        }

        let due = self
            .last_handshake
            .map_or(true, |t| now.saturating_sub(t) >= timing.handshake_interval);
        if due {
            self.last_handshake = Some(now);
            self.send_handshakes(wire);
            if self.channel.is_some() {
                let ping = self.link.lossy_frame(&[packet::PING]);
                self.transmit(&ping, now, wire);
            }
        }
        events
    }

    fn handshake_bytes(&self, wire: &Wire) -> Option<Vec<u8>> {
        let body = HandshakeBody {
            session_key: self.session.public_key(),
            recipient: self.peer,
            request: self.request.clone(),
        };
        match wire::handshake(wire.secret(), &body) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(peer = %self.peer.fmt_short(), "handshake build failed: {e}");
                None
            }
        }
    }

    /// Handshake on every candidate path.
    fn send_handshakes(&mut self, wire: &mut Wire) {
        let Some(bytes) = self.handshake_bytes(wire) else {
            return;
        };
        if wire.udp_enabled {
            for addr in wire.dht.resolve(&self.peer) {
                wire.send(&self.peer, &Path::Direct(addr), &bytes);
            }
        }
        if wire.relays.is_online(&self.peer) {
            wire.send(&self.peer, &Path::Relay, &bytes);
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// An authenticated handshake from the peer arrived on `path`.
    pub fn on_handshake(
        &mut self,
        body: HandshakeBody,
        path: Path,
        now: u64,
        wire: &mut Wire,
    ) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        if self.peer_session == Some(body.session_key) {
            return events;
        }
        if self.is_connected() {
            debug!(peer = %self.peer.fmt_short(), "peer rekeyed");
            events.extend(self.go_offline());
        }
        if self.status == ConnectionStatus::None {
            self.set_status(ConnectionStatus::Connecting, &mut events);
        }

        let local = wire.keypair.public();
        let keys = match crypto::handshake(&self.session, &body.session_key, &local, &self.peer) {
            Ok(keys) => keys,
            Err(e) => {
                debug!(peer = %self.peer.fmt_short(), "session key agreement failed: {e}");
                return events;
            }
        };
        self.channel = Some(SecureChannel::new(keys));
        self.peer_session = Some(body.session_key);
        self.path = Some(path);
        self.confirmed = false;
        self.link = ReliableLink::new();
        self.last_recv = now;
        debug!(peer = %self.peer.fmt_short(), path = %path.kind(), "session derived");

        if let Some(bytes) = self.handshake_bytes(wire) {
            wire.send(&self.peer, &path, &bytes);
        }
        let ping = self.link.lossy_frame(&[packet::PING]);
        self.transmit(&ping, now, wire);
        events
    }

    /// A secure channel packet from the peer.
    pub fn on_data(&mut self, packet: &[u8], now: u64) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        let Some(channel) = self.channel.as_mut() else {
            debug!(peer = %self.peer.fmt_short(), "data without session dropped");
            return events;
        };
        let plain = match channel.unwrap(packet) {
            Ok(plain) => plain,
            Err(reason) => {
                debug!(peer = %self.peer.fmt_short(), "packet rejected: {reason}");
                return events;
            }
        };
        self.last_recv = now;

        if !self.confirmed {
            self.confirmed = true;
            self.request = None;
            let status = match self.path.map(|p| p.kind()) {
                Some(PathKind::Direct) => ConnectionStatus::ConnectedDirect,
                _ => ConnectionStatus::ConnectedRelay,
            };
            self.set_status(status, &mut events);
        }

        let received = self.link.receive(&plain);
        events.extend(received.reliable.into_iter().map(ConnEvent::Packet));
        events.extend(received.lossy.map(ConnEvent::Packet));
        events
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    fn transmit(&mut self, frame: &[u8], now: u64, wire: &mut Wire) -> bool {
        let (Some(channel), Some(path)) = (self.channel.as_mut(), self.path) else {
            return false;
        };
        let packet = match channel.wrap(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(peer = %self.peer.fmt_short(), "wrap failed: {e}");
                return false;
            }
        };
        let datagram = wire::data(&wire.keypair.public(), &packet);
        let sent = wire.send(&self.peer, &path, &datagram);
        if sent {
            self.last_sent = now;
        }
        sent
    }

    /// Send due reliable frames, then any owed ack. Frames that fail to
    /// leave stay due for the next call.
    pub fn flush(&mut self, now: u64, wire: &mut Wire) {
        if self.channel.is_none() {
            return;
        }
        for (seq, frame) in self.link.due(now, wire.timing.retransmit_timeout) {
            if !self.transmit(&frame, now, wire) {
                break;
            }
            self.link.mark_sent(seq, now);
        }
        if self.link.ack_owed() {
            let ack = self.link.lossy_frame(&[]);
            self.transmit(&ack, now, wire);
        }
    }

    /// Send one application payload (type tag first).
    pub fn send_packet(
        &mut self,
        payload: Vec<u8>,
        lossy: bool,
        now: u64,
        wire: &mut Wire,
    ) -> Result<(), SendPacketError> {
        if !self.is_connected() {
            return Err(SendPacketError::NotConnected);
        }
        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(SendPacketError::TooLarge);
        }
        if lossy {
            let frame = self.link.lossy_frame(&payload);
            self.transmit(&frame, now, wire);
            return Ok(());
        }
        self.link
            .queue(payload)
            .map_err(|_| SendPacketError::SendQueueFull)?;
        self.flush(now, wire);
        Ok(())
    }
}
