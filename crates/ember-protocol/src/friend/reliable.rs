/// Reliable ordered delivery inside one secure channel.
///
/// ```text
/// reliable    [0x00][ack u32 BE][seq u32 BE][payload]
/// unreliable  [0x01][ack u32 BE][payload]
/// ```
///
/// Every frame carries a cumulative ack: the next reliable sequence the
/// sender of the frame expects. An unreliable frame with an empty payload
/// is a bare ack. Sequence arithmetic wraps.
use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

/// Unacknowledged reliable frames allowed in flight.
pub const SEND_WINDOW: usize = 1024;
/// Out-of-order frames buffered on receive.
pub const RECV_BUFFER: u32 = 1024;

const RELIABLE: u8 = 0x00;
const UNRELIABLE: u8 = 0x01;

pub const RELIABLE_OVERHEAD: usize = 1 + 4 + 4;

#[derive(Debug)]
struct Pending {
    seq: u32,
    payload: Vec<u8>,
    /// `None` until a transmission succeeded.
    sent_at: Option<u64>,
}

/// What one inbound frame yielded, in delivery order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    pub reliable: Vec<Vec<u8>>,
    pub lossy: Option<Vec<u8>>,
}

/// `a` strictly precedes `b` in wrapping sequence space.
fn before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

#[derive(Debug, Default)]
pub struct ReliableLink {
    next_send: u32,
    unacked: VecDeque<Pending>,
    next_recv: u32,
    buffered: BTreeMap<u32, Vec<u8>>,
    /// An ack is owed to the peer.
    ack_dirty: bool,
}

impl ReliableLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Room left in the send window.
    pub fn free_slots(&self) -> usize {
        SEND_WINDOW.saturating_sub(self.unacked.len())
    }

    pub fn ack_owed(&self) -> bool {
        self.ack_dirty
    }

    /// Queue a reliable payload. Handed back when the window is full.
    pub fn queue(&mut self, payload: Vec<u8>) -> Result<u32, Vec<u8>> {
        if self.unacked.len() >= SEND_WINDOW {
            return Err(payload);
        }
        let seq = self.next_send;
        self.next_send = self.next_send.wrapping_add(1);
        self.unacked.push_back(Pending {
            seq,
            payload,
            sent_at: None,
        });
        Ok(seq)
    }

    /// Frames that need (re)transmission at `now`: never sent, or sent
    /// more than `rto` ago. Call [`mark_sent`](Self::mark_sent) for each
    /// one that actually left.
    pub fn due(&mut self, now: u64, rto: u64) -> Vec<(u32, Vec<u8>)> {
        let ack = self.next_recv;
        let mut frames = Vec::new();
        for pending in &self.unacked {
            let due = pending
                .sent_at
                .map_or(true, |t| now.saturating_sub(t) >= rto);
            if due {
                let mut frame = Vec::with_capacity(RELIABLE_OVERHEAD + pending.payload.len());
                frame.push(RELIABLE);
                frame.extend_from_slice(&ack.to_be_bytes());
                frame.extend_from_slice(&pending.seq.to_be_bytes());
                frame.extend_from_slice(&pending.payload);
                frames.push((pending.seq, frame));
            }
        }
        if !frames.is_empty() {
            self.ack_dirty = false;
        }
        frames
    }

    pub fn mark_sent(&mut self, seq: u32, now: u64) {
        if let Some(pending) = self.unacked.iter_mut().find(|p| p.seq == seq) {
            pending.sent_at = Some(now);
        }
    }

    /// Wrap a lossy payload. An empty payload makes a bare ack.
    pub fn lossy_frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + 4 + payload.len());
        frame.push(UNRELIABLE);
        frame.extend_from_slice(&self.next_recv.to_be_bytes());
        frame.extend_from_slice(payload);
        self.ack_dirty = false;
        frame
    }

    fn on_ack(&mut self, ack: u32) {
        while let Some(front) = self.unacked.front() {
            if before(front.seq, ack) {
                self.unacked.pop_front();
            } else {
                break;
            }
        }
    }

    /// Process one inbound frame.
    pub fn receive(&mut self, frame: &[u8]) -> Received {
        let mut out = Received::default();
        if frame.len() < 5 {
            debug!(len = frame.len(), "short reliable frame dropped");
            return out;
        }
        let ack = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        match frame[0] {
            UNRELIABLE => {
                self.on_ack(ack);
                if frame.len() > 5 {
                    out.lossy = Some(frame[5..].to_vec());
                }
            }
            RELIABLE => {
                if frame.len() < RELIABLE_OVERHEAD {
                    debug!("truncated reliable frame dropped");
                    return out;
                }
                self.on_ack(ack);
                let seq = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
                let payload = &frame[RELIABLE_OVERHEAD..];
                self.ack_dirty = true;

                if seq == self.next_recv {
                    out.reliable.push(payload.to_vec());
                    self.next_recv = self.next_recv.wrapping_add(1);
                    while let Some(next) = self.buffered.remove(&self.next_recv) {
                        out.reliable.push(next);
                        self.next_recv = self.next_recv.wrapping_add(1);
                    }
                } else if before(self.next_recv, seq)
                    && seq.wrapping_sub(self.next_recv) < RECV_BUFFER
                {
                    self.buffered.entry(seq).or_insert_with(|| payload.to_vec());
                } else {
                    debug!(seq, expected = self.next_recv, "duplicate or far reliable frame dropped");
                }
            }
            other => debug!(kind = other, "unknown reliable frame kind dropped"),
        }
        out
    }
}
