/// RelayServer — forwards payloads between clients that routed to each
/// other.
///
/// Pure state machine keyed by client public key. The hosting socket
/// layer feeds decoded frames to [`RelayServer::handle`] and writes the
/// returned `(recipient, frame)` pairs to the matching client streams.
use std::collections::HashMap;

use tracing::debug;

use super::{ConnId, RelayFrame, MAX_ROUTES};
use crate::PublicKey;

/// Outbound frames addressed to connected clients.
pub type Outbox = Vec<(PublicKey, RelayFrame)>;

#[derive(Debug, Default)]
struct Client {
    routes: HashMap<ConnId, PublicKey>,
}

impl Client {
    fn conn_for(&self, peer: &PublicKey) -> Option<ConnId> {
        self.routes
            .iter()
            .find(|(_, p)| *p == peer)
            .map(|(id, _)| *id)
    }

    fn free_conn_id(&self) -> Option<ConnId> {
        (0..MAX_ROUTES)
            .filter_map(|i| ConnId::try_from(i).ok())
            .find(|id| !self.routes.contains_key(id))
    }
}

#[derive(Debug, Default)]
pub struct RelayServer {
    clients: HashMap<PublicKey, Client>,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Conn id `peer` uses for `client`, if both are present and `peer`
    /// routed back.
    fn back_route(&self, client: &PublicKey, peer: &PublicKey) -> Option<ConnId> {
        self.clients.get(peer)?.conn_for(client)
    }

    /// Process one frame from `from`.
    pub fn handle(&mut self, from: PublicKey, frame: RelayFrame) -> Outbox {
        let mut out = Outbox::new();

        if let RelayFrame::Hello { public_key } = frame {
            if public_key != from {
                debug!(client = %from.fmt_short(), "hello with foreign key dropped");
                return out;
            }
            if self.clients.contains_key(&from) {
                out.extend(self.disconnect(from));
            }
            self.clients.insert(from, Client::default());
            out.push((from, RelayFrame::Welcome));
            return out;
        }

        if !self.clients.contains_key(&from) {
            debug!(client = %from.fmt_short(), "frame before hello dropped");
            return out;
        }

        match frame {
            RelayFrame::RouteRequest { peer } => {
                if peer == from {
                    out.push((from, RelayFrame::RouteRejected { peer }));
                    return out;
                }
                let Some(client) = self.clients.get_mut(&from) else {
                    return out;
                };
                let conn_id = match client.conn_for(&peer).or_else(|| client.free_conn_id()) {
                    Some(id) => id,
                    None => {
                        out.push((from, RelayFrame::RouteRejected { peer }));
                        return out;
                    }
                };
                client.routes.insert(conn_id, peer);
                out.push((from, RelayFrame::RouteResponse { conn_id, peer }));

                if let Some(back) = self.back_route(&from, &peer) {
                    out.push((from, RelayFrame::Connected { conn_id }));
                    out.push((peer, RelayFrame::Connected { conn_id: back }));
                }
            }
            RelayFrame::Disconnected { conn_id } => {
                let removed = self
                    .clients
                    .get_mut(&from)
                    .and_then(|c| c.routes.remove(&conn_id));
                if let Some(peer) = removed {
                    if let Some(back) = self.back_route(&from, &peer) {
                        out.push((peer, RelayFrame::Disconnected { conn_id: back }));
                    }
                }
            }
            RelayFrame::Data { conn_id, payload } => {
                let peer = self.clients.get(&from).and_then(|c| c.routes.get(&conn_id)).copied();
                match peer.and_then(|p| self.back_route(&from, &p).map(|back| (p, back))) {
                    Some((peer, back)) => out.push((
                        peer,
                        RelayFrame::Data {
                            conn_id: back,
                            payload,
                        },
                    )),
                    None => debug!(client = %from.fmt_short(), conn_id, "data on offline route dropped"),
                }
            }
            RelayFrame::Ping { nonce } => out.push((from, RelayFrame::Pong { nonce })),
            RelayFrame::Pong { .. } => {}
            other => {
                debug!(client = %from.fmt_short(), "server-only frame from client dropped: {other:?}");
            }
        }
        out
    }

    /// Decode `bytes` and process them; output frames are re-encoded.
    /// Undecodable input yields nothing.
    pub fn handle_bytes(&mut self, from: PublicKey, bytes: &[u8]) -> Vec<(PublicKey, Vec<u8>)> {
        let frame = match RelayFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client = %from.fmt_short(), "undecodable frame dropped: {e}");
                return Vec::new();
            }
        };
        self.handle(from, frame)
            .into_iter()
            .filter_map(|(to, frame)| frame.to_bytes().ok().map(|b| (to, b)))
            .collect()
    }

    /// Forget `client` and tell everyone routed to it.
    pub fn disconnect(&mut self, client: PublicKey) -> Outbox {
        let mut out = Outbox::new();
        let Some(gone) = self.clients.remove(&client) else {
            return out;
        };
        for peer in gone.routes.values() {
            if let Some(back) = self.back_route(&client, peer) {
                out.push((*peer, RelayFrame::Disconnected { conn_id: back }));
            }
        }
        out
    }
}
