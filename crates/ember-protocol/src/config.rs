/// Configuration for a [`Node`](crate::Node).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use ember_protocol::NodeConfig;
///
/// let config = NodeConfig::new()
///     .udp_enabled(false)
///     .keepalive_interval(Duration::from_secs(2));
/// ```
use std::time::Duration;

use ember_transport::{RelayAddr, SecretKey};
use tracing::warn;

/// Comma-separated `ip:port@HEXKEY` relay list read by [`NodeConfig::new`].
pub const RELAYS_ENV: &str = "EMBER_RELAYS";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Long-term identity. Generated when absent.
    pub(crate) secret_key: Option<SecretKey>,
    pub(crate) udp_enabled: bool,
    pub(crate) relays: Vec<RelayAddr>,
    /// Spacing of handshake attempts while connecting.
    pub(crate) handshake_interval: Duration,
    /// Idle time after which a keepalive is sent. Three silent intervals
    /// take the friend offline.
    pub(crate) keepalive_interval: Duration,
    pub(crate) retransmit_timeout: Duration,
    /// Chunk requests in flight per incoming transfer.
    pub(crate) file_request_window: usize,
    pub(crate) group_ping_interval: Duration,
    pub(crate) group_peer_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the relay list format, skipping bad entries.
pub(crate) fn parse_relays(list: &str) -> Vec<RelayAddr> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(relay) => Some(relay),
            Err(e) => {
                warn!("ignoring relay entry {s:?}: {e}");
                None
            }
        })
        .collect()
}

impl NodeConfig {
    /// Create a new config with defaults.
    ///
    /// If the `EMBER_RELAYS` environment variable is set, its entries seed
    /// the relay list. More can be added with [`.relay()`](Self::relay).
    pub fn new() -> Self {
        let relays = std::env::var(RELAYS_ENV)
            .map(|s| parse_relays(&s))
            .unwrap_or_default();

        Self {
            secret_key: None,
            udp_enabled: true,
            relays,
            handshake_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(4),
            retransmit_timeout: Duration::from_secs(1),
            file_request_window: 64,
            group_ping_interval: Duration::from_secs(20),
            group_peer_timeout: Duration::from_secs(60),
        }
    }

    /// Use an existing identity.
    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    /// Allow direct UDP (default: true). When disabled every friend
    /// connects through relays.
    pub fn udp_enabled(mut self, enabled: bool) -> Self {
        self.udp_enabled = enabled;
        self
    }

    /// Add a relay server.
    pub fn relay(mut self, relay: RelayAddr) -> Self {
        if !self.relays.iter().any(|r| r.addr == relay.addr) {
            self.relays.push(relay);
        }
        self
    }

    pub fn handshake_interval(mut self, interval: Duration) -> Self {
        self.handshake_interval = interval;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    /// Chunk requests kept in flight per incoming transfer (minimum 1).
    pub fn file_request_window(mut self, chunks: usize) -> Self {
        self.file_request_window = chunks.max(1);
        self
    }

    pub fn group_ping_interval(mut self, interval: Duration) -> Self {
        self.group_ping_interval = interval;
        self
    }

    pub fn group_peer_timeout(mut self, timeout: Duration) -> Self {
        self.group_peer_timeout = timeout;
        self
    }
}

/// Millisecond view of the durations, as the state machines use them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    pub handshake_interval: u64,
    pub keepalive_interval: u64,
    pub retransmit_timeout: u64,
    pub file_request_window: usize,
    pub group_ping_interval: u64,
    pub group_peer_timeout: u64,
}

impl From<&NodeConfig> for Timing {
    fn from(config: &NodeConfig) -> Self {
        Self {
            handshake_interval: config.handshake_interval.as_millis() as u64,
            keepalive_interval: config.keepalive_interval.as_millis() as u64,
            retransmit_timeout: config.retransmit_timeout.as_millis() as u64,
            file_request_window: config.file_request_window,
            group_ping_interval: config.group_ping_interval.as_millis() as u64,
            group_peer_timeout: config.group_peer_timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let timing = Timing::from(&NodeConfig::new());
        assert_eq!(timing.handshake_interval, 500);
        assert_eq!(timing.keepalive_interval, 4_000);
        assert_eq!(timing.retransmit_timeout, 1_000);
        assert_eq!(timing.file_request_window, 64);
        assert!(NodeConfig::new().udp_enabled);
    }

    #[test]
    fn builder_overrides() {
        let config = NodeConfig::new()
            .udp_enabled(false)
            .file_request_window(0)
            .keepalive_interval(Duration::from_millis(250));
        assert!(!config.udp_enabled);
        assert_eq!(config.file_request_window, 1);
        assert_eq!(Timing::from(&config).keepalive_interval, 250);
    }

    #[test]
    fn relay_list_parsing_skips_garbage() {
        let key = SecretKey::from_bytes([4; 32]).public_key();
        let list = format!("10.0.0.1:3389@{key}, nonsense ,,10.0.0.2:443@{key}");
        let relays = parse_relays(&list);
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[1].addr, "10.0.0.2:443".parse().unwrap());
    }

    #[test]
    fn duplicate_relay_is_ignored() {
        let relay: RelayAddr = format!(
            "10.0.0.1:3389@{}",
            SecretKey::from_bytes([4; 32]).public_key()
        )
        .parse()
        .unwrap();
        let config = NodeConfig::new().relay(relay).relay(relay);
        assert_eq!(
            config.relays.iter().filter(|r| r.addr == relay.addr).count(),
            1
        );
    }
}
