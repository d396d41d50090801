/// File Transfer Engine.
///
/// Per-friend bookkeeping for numbered transfers in both directions. The
/// engine is pure: every operation returns the packets to send and the
/// events to report as [`FileAction`]s, and the node carries them out.
/// Callers check connectivity and send queue room first.
mod transfer;

use std::collections::BTreeMap;

use tracing::{debug, warn};

pub(crate) use transfer::Transfer;
use transfer::Phase;

use crate::arena::FriendId;
use crate::error::{FileChunkError, FileControlError, FileSeekError, FileSendError};
use crate::events::Event;
use crate::packet::{FileAnnounce, FileControlPacket, Packet, WireControl};
use crate::types::{
    Direction, FileControl, FileId, FileKind, ResumePoint, TransferId, MAX_FILENAME_LENGTH,
    MAX_FILE_CHUNK,
};

/// Output of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileAction {
    Send(Packet),
    Event(Event),
    /// A peer packet broke the transfer protocol. The connection stays up.
    Rejected {
        transfer: TransferId,
        error: FileChunkError,
    },
}

fn control_packet(id: TransferId, control: WireControl) -> FileAction {
    FileAction::Send(Packet::FileControl(FileControlPacket {
        direction: id.direction,
        number: id.number,
        control,
    }))
}

fn flip(direction: Direction) -> Direction {
    match direction {
        Direction::Incoming => Direction::Outgoing,
        Direction::Outgoing => Direction::Incoming,
    }
}

#[derive(Debug, Default)]
pub(crate) struct FileTransfers {
    outgoing: BTreeMap<u8, Transfer>,
    incoming: BTreeMap<u8, Transfer>,
}

impl FileTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, direction: Direction) -> &BTreeMap<u8, Transfer> {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    fn slots_mut(&mut self, direction: Direction) -> &mut BTreeMap<u8, Transfer> {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }

    /// Finished transfers stay visible until their number is reused.
    pub fn get(&self, id: TransferId) -> Option<&Transfer> {
        self.slots(id.direction).get(&id.number)
    }

    fn get_mut(&mut self, id: TransferId) -> Option<&mut Transfer> {
        self.slots_mut(id.direction).get_mut(&id.number)
    }

    /// Any transfer still moving bytes.
    pub fn has_running(&self) -> bool {
        self.outgoing
            .values()
            .chain(self.incoming.values())
            .any(Transfer::is_running)
    }

    // ── Host operations ──────────────────────────────────────────────────

    /// Allocate the lowest free outgoing number and announce it.
    pub fn send(
        &mut self,
        kind: FileKind,
        size: u64,
        file_id: FileId,
        filename: String,
    ) -> Result<(TransferId, Vec<FileAction>), FileSendError> {
        if filename.len() > MAX_FILENAME_LENGTH {
            return Err(FileSendError::NameTooLong);
        }
        let number = (0..=u8::MAX)
            .find(|n| self.outgoing.get(n).map_or(true, Transfer::is_finished))
            .ok_or(FileSendError::TooManyTransfers)?;
        let id = TransferId::outgoing(number);
        let announce = FileAnnounce {
            number,
            kind,
            size,
            file_id,
            filename: filename.clone(),
        };
        self.outgoing
            .insert(number, Transfer::new(id, kind, size, file_id, filename));
        debug!(transfer = %id, size, "file announced");
        Ok((id, vec![FileAction::Send(Packet::FileAnnounce(announce))]))
    }

    pub fn control(
        &mut self,
        id: TransferId,
        control: FileControl,
    ) -> Result<Vec<FileAction>, FileControlError> {
        let t = self.get_mut(id).ok_or(FileControlError::NotFound)?;
        if t.is_finished() {
            return Err(FileControlError::AlreadyComplete);
        }
        let wire = match control {
            FileControl::Cancel => {
                t.phase = Phase::Cancelled;
                WireControl::Kill
            }
            FileControl::Pause => {
                if t.phase != Phase::Transferring {
                    return Err(FileControlError::Denied);
                }
                if t.paused_by_us {
                    return Err(FileControlError::AlreadyPaused);
                }
                t.paused_by_us = true;
                WireControl::Pause
            }
            FileControl::Resume => match (t.phase, id.direction) {
                (Phase::Announced, Direction::Incoming) => {
                    t.phase = Phase::Transferring;
                    WireControl::Resume
                }
                (Phase::Announced, Direction::Outgoing) => return Err(FileControlError::Denied),
                _ if !t.paused_by_us => return Err(FileControlError::NotPaused),
                _ => {
                    t.paused_by_us = false;
                    WireControl::Resume
                }
            },
        };
        debug!(transfer = %id, ?control, "file control");
        Ok(vec![control_packet(id, wire)])
    }

    /// Start an accepted-to-be incoming transfer at `position`.
    pub fn seek(&mut self, id: TransferId, position: u64) -> Result<Vec<FileAction>, FileSeekError> {
        let t = self.get_mut(id).ok_or(FileSeekError::NotFound)?;
        if id.direction != Direction::Incoming || !t.can_seek_to(position) {
            return Err(FileSeekError::Denied);
        }
        t.seek(position);
        debug!(transfer = %id, position, "file seek");
        Ok(vec![control_packet(id, WireControl::Seek(position))])
    }

    /// Answer the oldest pending chunk request.
    pub fn send_chunk(
        &mut self,
        id: TransferId,
        position: u64,
        data: Vec<u8>,
    ) -> Result<Vec<FileAction>, FileChunkError> {
        if id.direction != Direction::Outgoing {
            return Err(FileChunkError::NotFound);
        }
        let t = self.get_mut(id).ok_or(FileChunkError::NotFound)?;
        match t.phase {
            Phase::Completed => return Err(FileChunkError::AlreadyComplete),
            Phase::Transferring => {}
            _ => return Err(FileChunkError::NotTransferring),
        }
        let Some(&(expected, length)) = t.pending.front() else {
            return Err(FileChunkError::WrongPosition);
        };
        if position != expected {
            return Err(FileChunkError::WrongPosition);
        }
        let length = usize::from(length);
        let valid = if t.is_stream() {
            data.len() <= length
        } else {
            data.len() == length
        };
        if !valid || data.len() > MAX_FILE_CHUNK {
            return Err(FileChunkError::InvalidLength);
        }
        t.pending.pop_front();
        t.position += data.len() as u64;
        if t.is_stream() && data.len() < length {
            debug!(transfer = %id, position = t.position, "stream ended");
            t.end_of_stream = true;
            t.pending.clear();
        }
        Ok(vec![FileAction::Send(Packet::FileChunkData {
            number: id.number,
            position,
            data,
        })])
    }

    // ── Peer packets ─────────────────────────────────────────────────────

    pub fn handle_announce(&mut self, friend: FriendId, announce: FileAnnounce) -> Vec<FileAction> {
        let id = TransferId::incoming(announce.number);
        if let Some(old) = self.incoming.get(&announce.number) {
            if !old.is_finished() {
                warn!(%friend, transfer = %id, "peer reused a live transfer number");
            }
        }
        let transfer = Transfer::new(
            id,
            announce.kind,
            announce.size,
            announce.file_id,
            announce.filename.clone(),
        );
        self.incoming.insert(announce.number, transfer);
        debug!(%friend, transfer = %id, size = announce.size, "file offered");
        vec![FileAction::Event(Event::FileAnnounce {
            friend,
            transfer: id,
            kind: announce.kind,
            size: announce.size,
            filename: announce.filename,
            file_id: announce.file_id,
        })]
    }

    pub fn handle_control(&mut self, friend: FriendId, packet: FileControlPacket) -> Vec<FileAction> {
        let id = TransferId {
            direction: flip(packet.direction),
            number: packet.number,
        };
        let Some(t) = self.get_mut(id) else {
            warn!(%friend, transfer = %id, "control for unknown transfer");
            return Vec::new();
        };
        if t.is_finished() {
            debug!(%friend, transfer = %id, "control for finished transfer ignored");
            return Vec::new();
        }
        let event = |control| {
            vec![FileAction::Event(Event::FileControl {
                friend,
                transfer: id,
                control,
            })]
        };
        match packet.control {
            WireControl::Kill => {
                t.phase = Phase::Cancelled;
                event(FileControl::Cancel)
            }
            WireControl::Pause if t.phase == Phase::Transferring && !t.paused_by_peer => {
                t.paused_by_peer = true;
                event(FileControl::Pause)
            }
            WireControl::Resume if t.phase == Phase::Announced && id.direction == Direction::Outgoing => {
                t.phase = Phase::Transferring;
                event(FileControl::Resume)
            }
            WireControl::Resume if t.phase == Phase::Transferring && t.paused_by_peer => {
                t.paused_by_peer = false;
                event(FileControl::Resume)
            }
            WireControl::Seek(position)
                if id.direction == Direction::Outgoing && t.can_seek_to(position) =>
            {
                t.seek(position);
                debug!(%friend, transfer = %id, position, "peer seeked");
                Vec::new()
            }
            other => {
                debug!(%friend, transfer = %id, control = ?other, "control ignored");
                Vec::new()
            }
        }
    }

    /// A chunk request for one of our outgoing transfers.
    pub fn handle_request(
        &mut self,
        friend: FriendId,
        number: u8,
        position: u64,
        length: u16,
    ) -> Vec<FileAction> {
        let id = TransferId::outgoing(number);
        let Some(t) = self.get_mut(id) else {
            warn!(%friend, transfer = %id, "chunk request for unknown transfer");
            return Vec::new();
        };
        match t.phase {
            Phase::Completed if length == 0 => {
                return vec![FileAction::Rejected {
                    transfer: id,
                    error: FileChunkError::AlreadyComplete,
                }];
            }
            Phase::Transferring => {}
            _ => {
                debug!(%friend, transfer = %id, "chunk request outside transfer dropped");
                return Vec::new();
            }
        }
        let request = FileAction::Event(Event::FileChunkRequest {
            friend,
            transfer: id,
            position,
            length: usize::from(length),
        });

        if length == 0 {
            let done = if t.is_stream() {
                t.end_of_stream
            } else {
                t.position == t.size
            };
            if !done || position != t.position || !t.pending.is_empty() {
                warn!(%friend, transfer = %id, position, "early completion request dropped");
                return Vec::new();
            }
            t.phase = Phase::Completed;
            debug!(%friend, transfer = %id, position, "file sent");
            return vec![
                request,
                FileAction::Send(Packet::FileChunkData {
                    number,
                    position,
                    data: Vec::new(),
                }),
            ];
        }

        if t.end_of_stream {
            debug!(%friend, transfer = %id, "request past end of stream ignored");
            return Vec::new();
        }
        let end = position.checked_add(u64::from(length));
        let in_bounds = t.is_stream() || end.is_some_and(|end| end <= t.size);
        if position != t.expected_request || usize::from(length) > MAX_FILE_CHUNK || !in_bounds {
            warn!(%friend, transfer = %id, position, length, "bad chunk request dropped");
            return Vec::new();
        }
        t.pending.push_back((position, length));
        t.expected_request = position.saturating_add(u64::from(length));
        vec![request]
    }

    /// Chunk data for one of our incoming transfers.
    pub fn handle_data(
        &mut self,
        friend: FriendId,
        number: u8,
        position: u64,
        data: Vec<u8>,
    ) -> Vec<FileAction> {
        let id = TransferId::incoming(number);
        let Some(t) = self.get_mut(id) else {
            warn!(%friend, transfer = %id, "chunk for unknown transfer");
            return Vec::new();
        };
        match t.phase {
            Phase::Completed => {
                return vec![FileAction::Rejected {
                    transfer: id,
                    error: FileChunkError::AlreadyComplete,
                }];
            }
            Phase::Transferring => {}
            _ => {
                debug!(%friend, transfer = %id, "chunk outside transfer dropped");
                return Vec::new();
            }
        }
        let Some(&(expected, length)) = t.outstanding.front() else {
            warn!(%friend, transfer = %id, position, "unrequested chunk dropped");
            return Vec::new();
        };
        if position != expected {
            warn!(%friend, transfer = %id, position, expected, "chunk at wrong position dropped");
            return Vec::new();
        }

        if length == 0 {
            if !data.is_empty() {
                warn!(%friend, transfer = %id, "data on completion chunk dropped");
                return Vec::new();
            }
            t.outstanding.pop_front();
            t.phase = Phase::Completed;
            debug!(%friend, transfer = %id, position, "file received");
            return vec![FileAction::Event(Event::FileChunk {
                friend,
                transfer: id,
                position,
                data,
            })];
        }

        let length = usize::from(length);
        let valid = if t.is_stream() {
            data.len() <= length
        } else {
            data.len() == length
        };
        if !valid {
            warn!(%friend, transfer = %id, got = data.len(), length, "chunk of wrong length dropped");
            return Vec::new();
        }
        t.outstanding.pop_front();
        t.position += data.len() as u64;
        if t.is_stream() && data.len() < length {
            t.end_of_stream = true;
            t.outstanding.clear();
            t.requested = t.position;
        }
        if data.is_empty() {
            return Vec::new();
        }
        vec![FileAction::Event(Event::FileChunk {
            friend,
            transfer: id,
            position,
            data,
        })]
    }

    // ── Timers and lifecycle ─────────────────────────────────────────────

    /// Chunk requests for running incoming transfers, at most `budget`.
    pub fn tick(&mut self, window: usize, mut budget: usize) -> Vec<FileAction> {
        let mut actions = Vec::new();
        for t in self.incoming.values_mut() {
            if budget == 0 {
                break;
            }
            let number = t.id.number;
            let requests = t.next_requests(window, budget);
            budget -= requests.len();
            actions.extend(requests.into_iter().map(|(position, length)| {
                FileAction::Send(Packet::FileChunkRequest {
                    number,
                    position,
                    length,
                })
            }));
        }
        actions
    }

    /// The friend went offline: cancel everything unfinished and hand
    /// back where each one stood.
    pub fn break_all(&mut self, friend: FriendId) -> (Vec<ResumePoint>, Vec<FileAction>) {
        let mut points = Vec::new();
        let mut actions = Vec::new();
        for t in self
            .outgoing
            .values_mut()
            .chain(self.incoming.values_mut())
            .filter(|t| !t.is_finished())
        {
            points.push(t.resume_point());
            t.phase = Phase::Cancelled;
            actions.push(FileAction::Event(Event::FileControl {
                friend,
                transfer: t.id,
                control: FileControl::Cancel,
            }));
        }
        if !points.is_empty() {
            debug!(%friend, count = points.len(), "transfers broken by disconnect");
        }
        (points, actions)
    }
}
