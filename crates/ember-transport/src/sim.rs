/// In-memory network for tests and simulations.
///
/// Every endpoint gets a synthetic UDP address. Relay servers run inside
/// the network and process frames synchronously on send. The DHT is an
/// oracle over the registered endpoints, available once the endpoint has
/// bootstrapped. Endpoints can be taken offline or have UDP disabled to
/// force traffic through relays.
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::relay::RelayServer;
use crate::{Dht, PublicKey, RelayAddr, SecretKey, Transport, TransportError};

/// Largest datagram the simulated UDP layer carries.
pub const SIM_MTU: usize = 2048;

const UDP_PORT: u16 = 33445;
const RELAY_PORT: u16 = 3389;

#[derive(Debug)]
struct SimNode {
    public_key: PublicKey,
    udp_enabled: bool,
    online: bool,
    bootstrapped: bool,
    udp_inbox: VecDeque<(SocketAddr, Vec<u8>)>,
    relay_inbox: VecDeque<(SocketAddr, Vec<u8>)>,
}

#[derive(Default)]
struct SimState {
    next_node: u16,
    next_relay: u16,
    nodes: HashMap<SocketAddr, SimNode>,
    by_key: HashMap<PublicKey, SocketAddr>,
    relays: HashMap<SocketAddr, RelayServer>,
    /// Datagrams dropped between these (from, to) pairs.
    blocked: HashSet<(SocketAddr, SocketAddr)>,
    delivered: u64,
}

impl SimState {
    fn deliver_relay(&mut self, relay: SocketAddr, out: Vec<(PublicKey, Vec<u8>)>) {
        for (to, frame) in out {
            let Some(addr) = self.by_key.get(&to).copied() else {
                continue;
            };
            if let Some(node) = self.nodes.get_mut(&addr) {
                if node.online {
                    node.relay_inbox.push_back((relay, frame));
                    self.delivered += 1;
                }
            }
        }
    }
}

/// Shared handle to the simulated network. Cheap to clone.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an endpoint for `public_key`.
    pub fn endpoint(&self, public_key: PublicKey, udp_enabled: bool) -> SimEndpoint {
        let mut state = self.lock();
        state.next_node += 1;
        let n = state.next_node;
        let addr = SocketAddr::from(([10, 0, (n >> 8) as u8, n as u8], UDP_PORT));
        state.nodes.insert(
            addr,
            SimNode {
                public_key,
                udp_enabled,
                online: true,
                bootstrapped: false,
                udp_inbox: VecDeque::new(),
                relay_inbox: VecDeque::new(),
            },
        );
        state.by_key.insert(public_key, addr);
        SimEndpoint {
            net: self.clone(),
            addr,
            public_key,
        }
    }

    /// Start a relay server inside the network.
    pub fn add_relay(&self) -> RelayAddr {
        let mut state = self.lock();
        state.next_relay += 1;
        let n = state.next_relay;
        let addr = SocketAddr::from(([10, 1, (n >> 8) as u8, n as u8], RELAY_PORT));
        state.relays.insert(addr, RelayServer::new());
        RelayAddr {
            addr,
            public_key: SecretKey::generate().public_key(),
        }
    }

    /// Take an endpoint off the network (or bring it back). Going offline
    /// also drops its relay sessions.
    pub fn set_online(&self, public_key: &PublicKey, online: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(addr) = state.by_key.get(public_key).copied() else {
            return;
        };
        if let Some(node) = state.nodes.get_mut(&addr) {
            node.online = online;
            if !online {
                node.udp_inbox.clear();
                node.relay_inbox.clear();
            }
        }
        if !online {
            let relays: Vec<SocketAddr> = state.relays.keys().copied().collect();
            for relay in relays {
                let out = match state.relays.get_mut(&relay) {
                    Some(server) => server
                        .disconnect(*public_key)
                        .into_iter()
                        .filter_map(|(to, f)| f.to_bytes().ok().map(|b| (to, b)))
                        .collect(),
                    None => Vec::new(),
                };
                state.deliver_relay(relay, out);
            }
        }
    }

    /// Drop UDP datagrams between two endpoints, both directions.
    pub fn block_udp(&self, a: &PublicKey, b: &PublicKey) {
        let mut state = self.lock();
        let x = state.by_key.get(a).copied();
        let y = state.by_key.get(b).copied();
        if let (Some(x), Some(y)) = (x, y) {
            state.blocked.insert((x, y));
            state.blocked.insert((y, x));
        }
    }

    /// Total datagrams and frames delivered so far.
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }
}

/// One node's view of the simulated network. Implements [`Transport`]
/// and [`Dht`].
#[derive(Clone)]
pub struct SimEndpoint {
    net: SimNetwork,
    addr: SocketAddr,
    public_key: PublicKey,
}

impl SimEndpoint {
    /// Synthetic UDP address of this endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

impl Transport for SimEndpoint {
    fn send_udp(&mut self, to: SocketAddr, datagram: &[u8]) -> Result<(), TransportError> {
        if datagram.len() > SIM_MTU {
            return Err(TransportError::MessageTooLarge {
                size: datagram.len(),
                max: SIM_MTU,
            });
        }
        let mut guard = self.net.lock();
        let state = &mut *guard;
        let me = state
            .nodes
            .get(&self.addr)
            .map(|n| (n.udp_enabled, n.online))
            .unwrap_or((false, false));
        match me {
            (false, _) => return Err(TransportError::UdpDisabled),
            (_, false) => return Err(TransportError::Unreachable(to)),
            _ => {}
        }
        if state.blocked.contains(&(self.addr, to)) {
            return Ok(());
        }
        let from = self.addr;
        if let Some(target) = state.nodes.get_mut(&to) {
            if target.online && target.udp_enabled {
                target.udp_inbox.push_back((from, datagram.to_vec()));
                state.delivered += 1;
            }
        }
        Ok(())
    }

    fn poll_udp(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        let mut state = self.net.lock();
        state.nodes.get_mut(&self.addr)?.udp_inbox.pop_front()
    }

    fn send_relay(&mut self, relay: SocketAddr, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.net.lock();
        let online = state.nodes.get(&self.addr).is_some_and(|n| n.online);
        if !online {
            return Err(TransportError::RelayUnavailable(relay));
        }
        let out = match state.relays.get_mut(&relay) {
            Some(server) => server.handle_bytes(self.public_key, frame),
            None => return Err(TransportError::RelayUnavailable(relay)),
        };
        state.deliver_relay(relay, out);
        Ok(())
    }

    fn poll_relay(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        let mut state = self.net.lock();
        state.nodes.get_mut(&self.addr)?.relay_inbox.pop_front()
    }
}

impl Dht for SimEndpoint {
    fn resolve(&mut self, public_key: &PublicKey) -> Vec<SocketAddr> {
        let state = self.net.lock();
        let ready = state.nodes.get(&self.addr).is_some_and(|n| n.bootstrapped && n.online);
        if !ready {
            return Vec::new();
        }
        state
            .by_key
            .get(public_key)
            .filter(|addr| {
                state
                    .nodes
                    .get(*addr)
                    .is_some_and(|n| n.udp_enabled && n.online)
            })
            .map(|addr| vec![*addr])
            .unwrap_or_default()
    }

    fn bootstrap(&mut self, addr: SocketAddr, public_key: PublicKey) {
        let mut state = self.net.lock();
        let known = state.nodes.get(&addr).is_some_and(|n| n.public_key == public_key);
        if !known {
            debug!(%addr, "bootstrap node not present in simulation");
            return;
        }
        if let Some(node) = state.nodes.get_mut(&self.addr) {
            node.bootstrapped = true;
        }
    }

    fn is_connected(&self) -> bool {
        let state = self.net.lock();
        state
            .nodes
            .get(&self.addr)
            .is_some_and(|n| n.bootstrapped && n.online && n.udp_enabled)
    }
}
