//! Simulated multi-node harness shared by the integration tests.
#![allow(dead_code)]

use ember_protocol::{
    ConnectionStatus, Event, FriendId, Node, NodeConfig, RelayAddr, SecretKey, SimNetwork,
};

/// Milliseconds between two simulated iterations.
pub const STEP_MS: u64 = 20;

pub struct Peer {
    pub node: Node,
    /// Everything reported since the last `take`.
    pub events: Vec<Event>,
}

impl Peer {
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

pub struct Sim {
    pub net: SimNetwork,
    pub relay: Option<RelayAddr>,
    pub now: u64,
    pub peers: Vec<Peer>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

impl Sim {
    pub fn new() -> Self {
        init_tracing();
        Self {
            net: SimNetwork::new(),
            relay: None,
            now: 1_000,
            peers: Vec::new(),
        }
    }

    /// A network with one relay server every node knows about.
    pub fn with_relay() -> Self {
        let mut sim = Self::new();
        sim.relay = Some(sim.net.add_relay());
        sim
    }

    pub fn config(&self, seed: u8, udp: bool) -> NodeConfig {
        let mut config = NodeConfig::new()
            .secret_key(SecretKey::from_bytes([seed; 32]))
            .udp_enabled(udp);
        if let Some(relay) = self.relay {
            config = config.relay(relay);
        }
        config
    }

    /// Add a node with a deterministic identity. Returns its index.
    pub fn add(&mut self, seed: u8, udp: bool) -> usize {
        let config = self.config(seed, udp);
        self.add_with(seed, udp, config)
    }

    /// Like `add`, with a caller-tuned config. `seed` and `udp` must match it.
    pub fn add_with(&mut self, seed: u8, udp: bool, config: NodeConfig) -> usize {
        let io = self.net.endpoint(SecretKey::from_bytes([seed; 32]).public_key(), udp);
        let (addr, public_key) = (io.addr(), io.public_key());
        let mut node = Node::new(config, Box::new(io.clone()), Box::new(io));
        node.bootstrap(addr, public_key);
        self.push(node)
    }

    /// Replace node `i` with one restored from `state`, which must hold
    /// the `seed` identity. The old node's network address is abandoned.
    pub fn restore(&mut self, i: usize, seed: u8, udp: bool, state: &[u8]) {
        let config = self.config(seed, udp);
        let io = self.net.endpoint(SecretKey::from_bytes([seed; 32]).public_key(), udp);
        let (addr, public_key) = (io.addr(), io.public_key());
        let mut node = Node::restore(config, Box::new(io.clone()), Box::new(io), state).expect("restore");
        node.bootstrap(addr, public_key);
        self.peers[i] = Peer {
            node,
            events: Vec::new(),
        };
    }

    fn push(&mut self, node: Node) -> usize {
        self.peers.push(Peer {
            node,
            events: Vec::new(),
        });
        self.peers.len() - 1
    }

    pub fn node(&mut self, i: usize) -> &mut Node {
        &mut self.peers[i].node
    }

    /// Make `a` and `b` friends of each other. Returns (b as seen by a,
    /// a as seen by b).
    pub fn befriend(&mut self, a: usize, b: usize) -> (FriendId, FriendId) {
        let key_a = self.peers[a].node.public_key();
        let key_b = self.peers[b].node.public_key();
        let fa = self.peers[a].node.add_friend(key_b).expect("add b");
        let fb = self.peers[b].node.add_friend(key_a).expect("add a");
        (fa, fb)
    }

    /// One iteration of every node at the current time.
    pub fn step(&mut self) {
        let now = self.now;
        for peer in &mut self.peers {
            peer.node.iterate_at(now, &mut peer.events);
        }
        self.now += STEP_MS;
    }

    pub fn run(&mut self, ms: u64) {
        for _ in 0..ms / STEP_MS {
            self.step();
        }
    }

    /// Step until `done` holds, at most `limit_ms`. Returns whether it held.
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&mut Sim) -> bool) -> bool {
        for _ in 0..limit_ms / STEP_MS {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    pub fn status(&self, i: usize, friend: FriendId) -> ConnectionStatus {
        self.peers[i]
            .node
            .friend_connection_status(friend)
            .expect("friend exists")
    }

    /// Wait for `a` and `b` to see each other connected.
    pub fn connect(&mut self, a: usize, fa: FriendId, b: usize, fb: FriendId) {
        let ok = self.run_until(5_000, |s| {
            s.status(a, fa).is_connected() && s.status(b, fb).is_connected()
        });
        assert!(ok, "friends did not connect");
    }
}

/// Status changes reported for `friend`, in order.
pub fn statuses(events: &[Event], friend: FriendId) -> Vec<ConnectionStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ConnectionStatus { friend: f, status } if *f == friend => Some(*status),
            _ => None,
        })
        .collect()
}
