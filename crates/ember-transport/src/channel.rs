/// Secure channel: per-friend authenticated encryption with anti-replay
/// sequencing.
///
/// Pure transform. `wrap` turns plaintext into `[seq u64 BE][ciphertext]`,
/// `unwrap` reverses it or rejects the packet. Retries, liveness and
/// reliability live in the friend connection layer above.
use crate::crypto::{self, Nonce, SessionKeys, NONCE_SIZE, TAG_SIZE};
use crate::CryptoError;

/// Number of sequence numbers behind the highest accepted one that may
/// still arrive out of order.
pub const REPLAY_WINDOW: u64 = 128;

const SEQ_SIZE: usize = 8;

/// Bytes added by [`SecureChannel::wrap`] on top of the plaintext.
pub const CHANNEL_OVERHEAD: usize = SEQ_SIZE + TAG_SIZE;

/// Why a received packet was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Reject {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("replayed or stale sequence number")]
    ReplayOrStale,
    #[error("malformed packet")]
    Malformed,
}

/// Sliding acceptance window over 64-bit sequence numbers.
///
/// Bit `i` of the bitmap records whether `highest - i` was seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u128,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seq` would be accepted right now.
    pub fn check(&self, seq: u64) -> bool {
        match self.highest {
            None => true,
            Some(top) if seq > top => true,
            Some(top) => {
                let age = top - seq;
                age < REPLAY_WINDOW && self.bitmap & (1u128 << age) == 0
            }
        }
    }

    /// Record `seq`. Returns `false` (and changes nothing) for a replay or
    /// a sequence number that fell out of the window.
    pub fn accept(&mut self, seq: u64) -> bool {
        if !self.check(seq) {
            return false;
        }
        match self.highest {
            Some(top) if seq <= top => {
                self.bitmap |= 1u128 << (top - seq);
            }
            Some(top) => {
                let shift = seq - top;
                self.bitmap = if shift >= REPLAY_WINDOW {
                    0
                } else {
                    self.bitmap << shift
                };
                self.bitmap |= 1;
                self.highest = Some(seq);
            }
            None => {
                self.bitmap = 1;
                self.highest = Some(seq);
            }
        }
        true
    }

    /// Highest sequence number accepted so far.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}

/// One live encrypted session with a friend.
#[derive(Debug)]
pub struct SecureChannel {
    keys: SessionKeys,
    send_seq: u64,
    window: ReplayWindow,
}

impl SecureChannel {
    pub fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            send_seq: 0,
            window: ReplayWindow::new(),
        }
    }

    /// Encrypt `plaintext` under the next send sequence number.
    pub fn wrap(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let seq = self.send_seq;
        let sealed = crypto::seal(&self.keys.send, &nonce_for(seq), plaintext)?;
        self.send_seq += 1;

        let mut packet = Vec::with_capacity(SEQ_SIZE + sealed.len());
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&sealed);
        Ok(packet)
    }

    /// Authenticate and decrypt a packet produced by the peer's `wrap`.
    ///
    /// The window only advances after successful authentication, so a
    /// forged packet cannot burn a sequence number.
    pub fn unwrap(&mut self, packet: &[u8]) -> Result<Vec<u8>, Reject> {
        if packet.len() < CHANNEL_OVERHEAD {
            return Err(Reject::Malformed);
        }
        let (seq_bytes, sealed) = packet.split_at(SEQ_SIZE);
        let mut raw = [0u8; SEQ_SIZE];
        raw.copy_from_slice(seq_bytes);
        let seq = u64::from_be_bytes(raw);

        if !self.window.check(seq) {
            return Err(Reject::ReplayOrStale);
        }
        let plaintext = crypto::open(&self.keys.recv, &nonce_for(seq), sealed)
            .map_err(|_| Reject::AuthenticationFailed)?;
        self.window.accept(seq);
        Ok(plaintext)
    }

    /// Number of packets wrapped so far.
    pub fn sent(&self) -> u64 {
        self.send_seq
    }

    pub fn window(&self) -> &ReplayWindow {
        &self.window
    }
}

fn nonce_for(seq: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..SEQ_SIZE].copy_from_slice(&seq.to_le_bytes());
    nonce
}
