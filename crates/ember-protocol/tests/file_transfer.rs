/// Integration tests: file transfers between two connected friends.
///
/// The test plays the host on both sides: it answers chunk requests from
/// an in-memory source and reassembles what arrives.
mod common;

use std::collections::VecDeque;

use common::Sim;
use ember_protocol::types::{FILE_SIZE_UNBOUNDED, MAX_FILENAME_LENGTH};
use ember_protocol::{
    Direction, Event, FileChunkError, FileControl, FileKind, FileSendError, FriendId, Node,
    TransferId, TransferState,
};

/// Sender-side host: answers requests in order from `data`.
struct Upload {
    friend: FriendId,
    transfer: TransferId,
    data: Vec<u8>,
    queue: VecDeque<(u64, usize)>,
    /// Every request seen, completion included.
    requests: Vec<(u64, usize)>,
    /// Stop answering once this many bytes went out.
    stop_after: Option<u64>,
    sent: u64,
}

impl Upload {
    fn new(friend: FriendId, transfer: TransferId, data: Vec<u8>) -> Self {
        Self {
            friend,
            transfer,
            data,
            queue: VecDeque::new(),
            requests: Vec::new(),
            stop_after: None,
            sent: 0,
        }
    }

    fn serve(&mut self, node: &mut Node, events: Vec<Event>) {
        for event in events {
            if let Event::FileChunkRequest {
                friend,
                transfer,
                position,
                length,
            } = event
            {
                if friend == self.friend && transfer == self.transfer {
                    self.requests.push((position, length));
                    if length > 0 {
                        self.queue.push_back((position, length));
                    }
                }
            }
        }
        while let Some(&(position, length)) = self.queue.front() {
            if self.stop_after.is_some_and(|limit| self.sent >= limit) {
                return;
            }
            let start = (position as usize).min(self.data.len());
            let end = (start + length).min(self.data.len());
            match node.file_send_chunk(self.friend, self.transfer, position, &self.data[start..end]) {
                Ok(()) => {
                    self.queue.pop_front();
                    self.sent += (end - start) as u64;
                    if end - start < length {
                        // Short chunk ends a stream.
                        self.queue.clear();
                    }
                }
                Err(FileChunkError::SendQueueFull) => return,
                Err(e) => panic!("chunk at {position}: {e}"),
            }
        }
    }
}

/// Receiver-side host: reassembles chunks from `offset`.
struct Download {
    friend: FriendId,
    transfer: TransferId,
    offset: u64,
    received: Vec<u8>,
    /// Empty chunks seen.
    ends: usize,
    done: bool,
}

impl Download {
    fn new(friend: FriendId, transfer: TransferId, offset: u64) -> Self {
        Self {
            friend,
            transfer,
            offset,
            received: Vec::new(),
            ends: 0,
            done: false,
        }
    }

    fn collect(&mut self, events: Vec<Event>) {
        for event in events {
            if let Event::FileChunk {
                friend,
                transfer,
                position,
                data,
            } = event
            {
                if friend != self.friend || transfer != self.transfer {
                    continue;
                }
                if data.is_empty() {
                    self.ends += 1;
                    self.done = true;
                } else {
                    assert_eq!(position, self.offset + self.received.len() as u64);
                    self.received.extend_from_slice(&data);
                }
            }
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Two connected friends: (sim, a, fa, b, fb).
fn connected() -> (Sim, usize, FriendId, usize, FriendId) {
    let mut sim = Sim::new();
    let a = sim.add(1, true);
    let b = sim.add(2, true);
    let (fa, fb) = sim.befriend(a, b);
    sim.connect(a, fa, b, fb);
    sim.peers[a].take();
    sim.peers[b].take();
    (sim, a, fa, b, fb)
}

/// Wait for `b` to see the announce. Returns the incoming transfer id.
fn await_announce(sim: &mut Sim, b: usize, expect_size: u64) -> TransferId {
    let mut found = None;
    let ok = sim.run_until(2_000, |s| {
        for event in s.peers[b].take() {
            if let Event::FileAnnounce { transfer, size, .. } = event {
                assert_eq!(size, expect_size);
                found = Some(transfer);
            }
        }
        found.is_some()
    });
    assert!(ok, "announce never arrived");
    found.expect("announce")
}

fn pump(sim: &mut Sim, a: usize, up: &mut Upload, b: usize, down: &mut Download, limit_ms: u64) -> bool {
    sim.run_until(limit_ms, |s| {
        let events = s.peers[a].take();
        up.serve(&mut s.peers[a].node, events);
        down.collect(s.peers[b].take());
        down.done
    })
}

#[test]
fn large_file_after_seek() {
    let (mut sim, a, fa, b, fb) = connected();
    let data = pattern(4 << 20);
    let size = data.len() as u64;

    let out = sim
        .node(a)
        .file_send(fa, FileKind::Data, size, None, "big.bin")
        .unwrap();
    assert_eq!(out.direction, Direction::Outgoing);
    assert_eq!(sim.node(a).file_state(fa, out), Ok(TransferState::Announced));
    let incoming = await_announce(&mut sim, b, size);
    assert_eq!(sim.node(b).file_id(fb, incoming), sim.node(a).file_id(fa, out));

    sim.node(b).file_seek(fb, incoming, 1337).unwrap();
    sim.node(b).file_control(fb, incoming, FileControl::Resume).unwrap();

    let mut up = Upload::new(fa, out, data.clone());
    let mut down = Download::new(fb, incoming, 1337);
    assert!(pump(&mut sim, a, &mut up, b, &mut down, 120_000), "transfer stalled");
    // Late duplicates of the completion would show up here.
    sim.run(500);
    down.collect(sim.peers[b].take());
    let late = sim.peers[a].take();
    up.serve(&mut sim.peers[a].node, late);

    assert_eq!(down.received, data[1337..]);
    assert_eq!(down.ends, 1);

    assert_eq!(up.requests.first().map(|r| r.0), Some(1337));
    assert!(up.requests.windows(2).all(|w| w[0].0 < w[1].0));
    let completions: Vec<_> = up.requests.iter().filter(|r| r.1 == 0).collect();
    assert_eq!(completions, vec![&(size, 0)]);
    assert_eq!(up.requests.last(), Some(&(size, 0)));

    assert_eq!(sim.node(a).file_state(fa, out), Ok(TransferState::Completed));
    assert_eq!(sim.node(b).file_state(fb, incoming), Ok(TransferState::Completed));
    assert_eq!(sim.node(a).file_position(fa, out), Ok(size));
    assert_eq!(sim.node(b).file_position(fb, incoming), Ok(size));
}

#[test]
fn stream_ends_with_short_chunk() {
    let (mut sim, a, fa, b, fb) = connected();
    let data = pattern(5_000);

    let out = sim
        .node(a)
        .file_send(fa, FileKind::Data, FILE_SIZE_UNBOUNDED, None, "live.pcm")
        .unwrap();
    let incoming = await_announce(&mut sim, b, FILE_SIZE_UNBOUNDED);
    sim.node(b).file_control(fb, incoming, FileControl::Resume).unwrap();

    let mut up = Upload::new(fa, out, data.clone());
    let mut down = Download::new(fb, incoming, 0);
    assert!(pump(&mut sim, a, &mut up, b, &mut down, 10_000), "stream stalled");

    assert_eq!(down.received, data);
    assert_eq!(sim.node(a).file_state(fa, out), Ok(TransferState::Completed));
    assert_eq!(sim.node(b).file_position(fb, incoming), Ok(5_000));
}

#[test]
fn zero_size_file_completes_without_data() {
    let (mut sim, a, fa, b, fb) = connected();
    let out = sim
        .node(a)
        .file_send(fa, FileKind::Avatar, 0, None, "empty")
        .unwrap();
    let incoming = await_announce(&mut sim, b, 0);
    sim.node(b).file_control(fb, incoming, FileControl::Resume).unwrap();

    let mut up = Upload::new(fa, out, Vec::new());
    let mut down = Download::new(fb, incoming, 0);
    assert!(pump(&mut sim, a, &mut up, b, &mut down, 2_000));
    assert!(down.received.is_empty());
    assert_eq!(sim.node(a).file_state(fa, out), Ok(TransferState::Completed));
}

#[test]
fn cancel_reaches_the_receiver() {
    let (mut sim, a, fa, b, fb) = connected();
    let out = sim
        .node(a)
        .file_send(fa, FileKind::Data, 10_000, None, "doc.txt")
        .unwrap();
    let incoming = await_announce(&mut sim, b, 10_000);

    sim.node(a).file_control(fa, out, FileControl::Cancel).unwrap();
    sim.run(200);

    assert!(sim.peers[b].take().contains(&Event::FileControl {
        friend: fb,
        transfer: incoming,
        control: FileControl::Cancel,
    }));
    assert_eq!(sim.node(b).file_state(fb, incoming), Ok(TransferState::Cancelled));
    assert_eq!(
        sim.node(a).file_control(fa, out, FileControl::Cancel),
        Err(ember_protocol::FileControlError::AlreadyComplete)
    );
}

#[test]
fn bad_announce_arguments() {
    let (mut sim, a, fa, _, _) = connected();
    let long = "n".repeat(MAX_FILENAME_LENGTH + 1);
    assert_eq!(
        sim.node(a).file_send(fa, FileKind::Data, 1, None, &long),
        Err(FileSendError::NameTooLong)
    );
}

#[test]
fn disconnect_leaves_resume_points() {
    let (mut sim, a, fa, b, fb) = connected();
    let data = pattern(100_000);
    let size = data.len() as u64;
    let out = sim
        .node(a)
        .file_send(fa, FileKind::Data, size, None, "part.bin")
        .unwrap();
    let file_id = sim.node(a).file_id(fa, out).unwrap();
    let incoming = await_announce(&mut sim, b, size);
    sim.node(b).file_control(fb, incoming, FileControl::Resume).unwrap();

    let mut up = Upload::new(fa, out, data);
    up.stop_after = Some(20_000);
    let mut down = Download::new(fb, incoming, 0);
    pump(&mut sim, a, &mut up, b, &mut down, 1_000);
    assert!(down.received.len() >= 20_000);
    assert!(!down.done);

    let key_b = sim.node(b).public_key();
    sim.net.set_online(&key_b, false);
    let gone = sim.run_until(20_000, |s| !s.status(a, fa).is_connected());
    assert!(gone);

    let events = sim.peers[a].take();
    assert!(events.contains(&Event::FileControl {
        friend: fa,
        transfer: out,
        control: FileControl::Cancel,
    }));
    assert_eq!(sim.node(a).file_state(fa, out), Ok(TransferState::Cancelled));
    let points = sim.node(a).resume_points(fa).unwrap().to_vec();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].direction, Direction::Outgoing);
    assert_eq!(points[0].file_id, file_id);
    assert_eq!(points[0].filename, "part.bin");
    assert_eq!(points[0].position, up.sent);

    sim.node(a).clear_resume_points(fa).unwrap();
    assert!(sim.node(a).resume_points(fa).unwrap().is_empty());
}
