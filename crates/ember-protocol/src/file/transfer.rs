/// One direction of one file exchange.
///
/// The receiver drives the flow: it keeps a FIFO of outstanding chunk
/// requests and accepts data only for the oldest one. The sender keeps a
/// FIFO of requests the host has not answered yet.
use std::collections::VecDeque;

use crate::types::{
    Direction, FileId, FileKind, ResumePoint, TransferId, TransferState, FILE_SIZE_UNBOUNDED,
    MAX_FILE_CHUNK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Announced,
    Transferring,
    Completed,
    Cancelled,
}

/// A `(position, length)` chunk request.
pub(crate) type Request = (u64, u16);

#[derive(Debug)]
pub(crate) struct Transfer {
    pub id: TransferId,
    pub kind: FileKind,
    pub size: u64,
    pub file_id: FileId,
    pub filename: String,
    pub phase: Phase,
    pub paused_by_us: bool,
    pub paused_by_peer: bool,
    /// Bytes received (incoming) or sent (outgoing).
    pub position: u64,
    /// A stream ended with a short chunk.
    pub end_of_stream: bool,

    // Receiver side.
    pub requested: u64,
    pub outstanding: VecDeque<Request>,
    pub completion_requested: bool,

    // Sender side.
    pub pending: VecDeque<Request>,
    pub expected_request: u64,
}

impl Transfer {
    pub fn new(id: TransferId, kind: FileKind, size: u64, file_id: FileId, filename: String) -> Self {
        Self {
            id,
            kind,
            size,
            file_id,
            filename,
            phase: Phase::Announced,
            paused_by_us: false,
            paused_by_peer: false,
            position: 0,
            end_of_stream: false,
            requested: 0,
            outstanding: VecDeque::new(),
            completion_requested: false,
            pending: VecDeque::new(),
            expected_request: 0,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.size == FILE_SIZE_UNBOUNDED
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Cancelled)
    }

    /// Transferring and held paused by neither side.
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Transferring && !self.paused_by_us && !self.paused_by_peer
    }

    pub fn state(&self) -> TransferState {
        match self.phase {
            Phase::Announced => TransferState::Announced,
            Phase::Transferring if self.paused_by_us || self.paused_by_peer => TransferState::Paused,
            Phase::Transferring => TransferState::Active,
            Phase::Completed => TransferState::Completed,
            Phase::Cancelled => TransferState::Cancelled,
        }
    }

    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            direction: self.id.direction,
            file_id: self.file_id,
            kind: self.kind,
            size: self.size,
            filename: self.filename.clone(),
            position: self.position,
        }
    }

    /// Seek target accepted before streaming starts.
    pub fn can_seek_to(&self, position: u64) -> bool {
        self.phase == Phase::Announced && position < self.size
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
        self.requested = position;
        self.expected_request = position;
    }

    /// Next chunk requests, at most `budget` of them, keeping no more
    /// than `window` outstanding. Ends with the single zero-length
    /// completion request once every byte has arrived.
    pub fn next_requests(&mut self, window: usize, mut budget: usize) -> Vec<Request> {
        debug_assert_eq!(self.id.direction, Direction::Incoming);
        let mut out = Vec::new();
        if !self.is_running() || self.completion_requested {
            return out;
        }
        let more_data = |t: &Transfer| {
            if t.is_stream() {
                !t.end_of_stream
            } else {
                t.requested < t.size
            }
        };
        while budget > 0 && self.outstanding.len() < window && more_data(self) {
            let remaining = self.size.saturating_sub(self.requested);
            let length = remaining.min(MAX_FILE_CHUNK as u64) as u16;
            let request = (self.requested, length);
            self.outstanding.push_back(request);
            self.requested = self.requested.saturating_add(u64::from(length));
            out.push(request);
            budget -= 1;
        }
        if budget > 0 && !more_data(self) && self.outstanding.is_empty() {
            let request = (self.position, 0);
            self.outstanding.push_back(request);
            self.completion_requested = true;
            out.push(request);
        }
        out
    }
}
