/// Application packet codec.
///
/// The first byte of every decrypted payload is a type tag. Hot-path file
/// packets use fixed big-endian headers; structured packets carry a
/// MessagePack body after the tag. Unknown tags decode to `None` and are
/// dropped by the caller.
use serde::{Deserialize, Serialize};

use crate::error::PacketError;
use crate::group::{GroupBroadcast, GroupInvite, GroupSync};
use crate::types::{
    Direction, FileId, FileKind, MessageKind, MAX_CUSTOM_PACKET_SIZE, MAX_FILENAME_LENGTH,
    MAX_FILE_CHUNK, MAX_MESSAGE_LENGTH, MAX_NAME_LENGTH, MAX_PACKET_PAYLOAD,
    MAX_STATUS_MESSAGE_LENGTH,
};

// ── Type tags ────────────────────────────────────────────────────────────

pub const PING: u8 = 0x10;
pub const KILL: u8 = 0x11;
pub const NAME: u8 = 0x30;
pub const STATUS_MESSAGE: u8 = 0x31;
pub const TYPING: u8 = 0x33;
pub const MESSAGE: u8 = 0x40;
pub const ACTION: u8 = 0x41;
pub const FILE_ANNOUNCE: u8 = 0x50;
pub const FILE_CONTROL: u8 = 0x51;
pub const FILE_CHUNK_REQUEST: u8 = 0x52;
pub const FILE_CHUNK_DATA: u8 = 0x53;
pub const GROUP_INVITE: u8 = 0x60;
pub const GROUP_SYNC: u8 = 0x61;
pub const GROUP_MESSAGE: u8 = 0x62;
pub const CUSTOM_LOSSLESS: u8 = 0xA0;
pub const CUSTOM_LOSSY: u8 = 0xC8;

/// `[tag][number][position u64]`
const CHUNK_HEADER: usize = 1 + 1 + 8;

// ── Structured bodies ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnounce {
    pub number: u8,
    pub kind: FileKind,
    pub size: u64,
    pub file_id: FileId,
    pub filename: String,
}

/// Control as it travels on the wire. `Kill` is a cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireControl {
    Resume,
    Pause,
    Kill,
    Seek(u64),
}

/// `direction` is from the author's side: `Outgoing` means the author's
/// outgoing transfer, which the reader knows as incoming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileControlPacket {
    pub direction: Direction,
    pub number: u8,
    pub control: WireControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping,
    Kill,
    Name(String),
    StatusMessage(String),
    Typing(bool),
    Message { kind: MessageKind, text: String },
    FileAnnounce(FileAnnounce),
    FileControl(FileControlPacket),
    FileChunkRequest { number: u8, position: u64, length: u16 },
    FileChunkData { number: u8, position: u64, data: Vec<u8> },
    GroupInvite(GroupInvite),
    GroupSync(GroupSync),
    GroupMessage(GroupBroadcast),
    CustomLossless(Vec<u8>),
    CustomLossy(Vec<u8>),
}

fn check(what: &'static str, size: usize, max: usize) -> Result<(), PacketError> {
    if size > max {
        return Err(PacketError::TooLarge { what, size, max });
    }
    Ok(())
}

fn text(what: &'static str, body: &[u8], max: usize) -> Result<String, PacketError> {
    check(what, body.len(), max)?;
    String::from_utf8(body.to_vec()).map_err(|_| PacketError::InvalidText)
}

fn with_tag<T: Serialize>(tag: u8, body: &T) -> Result<Vec<u8>, PacketError> {
    let mut out = vec![tag];
    rmp_serde::encode::write(&mut out, body)?;
    Ok(out)
}

impl Packet {
    /// Lossy packets bypass the reliable sub-layer.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Self::Ping | Self::Kill | Self::CustomLossy(_))
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Ping => PING,
            Self::Kill => KILL,
            Self::Name(_) => NAME,
            Self::StatusMessage(_) => STATUS_MESSAGE,
            Self::Typing(_) => TYPING,
            Self::Message {
                kind: MessageKind::Normal,
                ..
            } => MESSAGE,
            Self::Message {
                kind: MessageKind::Action,
                ..
            } => ACTION,
            Self::FileAnnounce(_) => FILE_ANNOUNCE,
            Self::FileControl(_) => FILE_CONTROL,
            Self::FileChunkRequest { .. } => FILE_CHUNK_REQUEST,
            Self::FileChunkData { .. } => FILE_CHUNK_DATA,
            Self::GroupInvite(_) => GROUP_INVITE,
            Self::GroupSync(_) => GROUP_SYNC,
            Self::GroupMessage(_) => GROUP_MESSAGE,
            Self::CustomLossless(_) => CUSTOM_LOSSLESS,
            Self::CustomLossy(_) => CUSTOM_LOSSY,
        }
    }

    /// Encode, enforcing the same limits the decoder enforces.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let tag = self.tag();
        let out = match self {
            Self::Ping | Self::Kill => vec![tag],
            Self::Name(name) => {
                check("name", name.len(), MAX_NAME_LENGTH)?;
                [&[tag][..], name.as_bytes()].concat()
            }
            Self::StatusMessage(status) => {
                check("status message", status.len(), MAX_STATUS_MESSAGE_LENGTH)?;
                [&[tag][..], status.as_bytes()].concat()
            }
            Self::Typing(typing) => vec![tag, u8::from(*typing)],
            Self::Message { text, .. } => {
                check("message", text.len(), MAX_MESSAGE_LENGTH)?;
                [&[tag][..], text.as_bytes()].concat()
            }
            Self::FileAnnounce(announce) => {
                check("filename", announce.filename.len(), MAX_FILENAME_LENGTH)?;
                with_tag(tag, announce)?
            }
            Self::FileControl(control) => with_tag(tag, control)?,
            Self::FileChunkRequest {
                number,
                position,
                length,
            } => {
                let mut out = Vec::with_capacity(CHUNK_HEADER + 2);
                out.push(tag);
                out.push(*number);
                out.extend_from_slice(&position.to_be_bytes());
                out.extend_from_slice(&length.to_be_bytes());
                out
            }
            Self::FileChunkData {
                number,
                position,
                data,
            } => {
                check("file chunk", data.len(), MAX_FILE_CHUNK)?;
                let mut out = Vec::with_capacity(CHUNK_HEADER + data.len());
                out.push(tag);
                out.push(*number);
                out.extend_from_slice(&position.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Self::GroupInvite(invite) => with_tag(tag, invite)?,
            Self::GroupSync(sync) => with_tag(tag, sync)?,
            Self::GroupMessage(broadcast) => with_tag(tag, broadcast)?,
            Self::CustomLossless(data) | Self::CustomLossy(data) => {
                check("custom packet", data.len(), MAX_CUSTOM_PACKET_SIZE)?;
                [&[tag][..], data.as_slice()].concat()
            }
        };
        check("packet", out.len(), MAX_PACKET_PAYLOAD)?;
        Ok(out)
    }

    /// Decode one payload. `Ok(None)` for an unknown tag.
    pub fn decode(bytes: &[u8]) -> Result<Option<Packet>, PacketError> {
        let (&tag, body) = bytes.split_first().ok_or(PacketError::Empty)?;
        check("packet", bytes.len(), MAX_PACKET_PAYLOAD)?;
        let packet = match tag {
            PING => Self::Ping,
            KILL => Self::Kill,
            NAME => Self::Name(text("name", body, MAX_NAME_LENGTH)?),
            STATUS_MESSAGE => {
                Self::StatusMessage(text("status message", body, MAX_STATUS_MESSAGE_LENGTH)?)
            }
            TYPING => match body.first() {
                Some(&b) => Self::Typing(b != 0),
                None => return Err(PacketError::Truncated("typing")),
            },
            MESSAGE | ACTION => {
                if body.is_empty() {
                    return Err(PacketError::Truncated("message"));
                }
                let kind = if tag == MESSAGE {
                    MessageKind::Normal
                } else {
                    MessageKind::Action
                };
                Self::Message {
                    kind,
                    text: text("message", body, MAX_MESSAGE_LENGTH)?,
                }
            }
            FILE_ANNOUNCE => {
                let announce: FileAnnounce = rmp_serde::from_slice(body)?;
                check("filename", announce.filename.len(), MAX_FILENAME_LENGTH)?;
                Self::FileAnnounce(announce)
            }
            FILE_CONTROL => Self::FileControl(rmp_serde::from_slice(body)?),
            FILE_CHUNK_REQUEST => {
                if bytes.len() != CHUNK_HEADER + 2 {
                    return Err(PacketError::Truncated("chunk request"));
                }
                let (number, position) = chunk_header(bytes);
                let length = u16::from_be_bytes([bytes[CHUNK_HEADER], bytes[CHUNK_HEADER + 1]]);
                Self::FileChunkRequest {
                    number,
                    position,
                    length,
                }
            }
            FILE_CHUNK_DATA => {
                if bytes.len() < CHUNK_HEADER {
                    return Err(PacketError::Truncated("chunk data"));
                }
                let data = &bytes[CHUNK_HEADER..];
                check("file chunk", data.len(), MAX_FILE_CHUNK)?;
                let (number, position) = chunk_header(bytes);
                Self::FileChunkData {
                    number,
                    position,
                    data: data.to_vec(),
                }
            }
            GROUP_INVITE => Self::GroupInvite(rmp_serde::from_slice(body)?),
            GROUP_SYNC => Self::GroupSync(rmp_serde::from_slice(body)?),
            GROUP_MESSAGE => Self::GroupMessage(rmp_serde::from_slice(body)?),
            CUSTOM_LOSSLESS | CUSTOM_LOSSY => {
                if body.is_empty() {
                    return Err(PacketError::Truncated("custom packet"));
                }
                check("custom packet", body.len(), MAX_CUSTOM_PACKET_SIZE)?;
                if tag == CUSTOM_LOSSLESS {
                    Self::CustomLossless(body.to_vec())
                } else {
                    Self::CustomLossy(body.to_vec())
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }
}

/// Caller guarantees `bytes.len() >= CHUNK_HEADER`.
fn chunk_header(bytes: &[u8]) -> (u8, u64) {
    let mut position = [0u8; 8];
    position.copy_from_slice(&bytes[2..CHUNK_HEADER]);
    (bytes[1], u64::from_be_bytes(position))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), Some(packet));
    }

    #[test]
    fn simple_packets_roundtrip() {
        roundtrip(Packet::Ping);
        roundtrip(Packet::Typing(true));
        roundtrip(Packet::Name("alice".into()));
        roundtrip(Packet::Message {
            kind: MessageKind::Action,
            text: "waves".into(),
        });
        roundtrip(Packet::FileControl(FileControlPacket {
            direction: Direction::Outgoing,
            number: 3,
            control: WireControl::Seek(1337),
        }));
    }

    #[test]
    fn chunk_request_layout_is_fixed() {
        let bytes = Packet::FileChunkRequest {
            number: 7,
            position: 0x0102,
            length: 1371,
        }
        .encode()
        .unwrap();
        assert_eq!(bytes, vec![FILE_CHUNK_REQUEST, 7, 0, 0, 0, 0, 0, 0, 1, 2, 0x05, 0x5b]);
    }

    #[test]
    fn zero_length_chunk_data_is_valid() {
        roundtrip(Packet::FileChunkData {
            number: 0,
            position: 42,
            data: Vec::new(),
        });
    }

    #[test]
    fn maximum_message_fits_and_one_more_is_refused() {
        let max = "G".repeat(MAX_MESSAGE_LENGTH);
        roundtrip(Packet::Message {
            kind: MessageKind::Normal,
            text: max.clone(),
        });
        let over = Packet::Message {
            kind: MessageKind::Normal,
            text: max + "G",
        };
        assert!(matches!(over.encode(), Err(PacketError::TooLarge { .. })));
    }

    #[test]
    fn oversized_inbound_is_rejected() {
        let mut bytes = vec![MESSAGE];
        bytes.extend(std::iter::repeat(b'x').take(MAX_MESSAGE_LENGTH + 1));
        assert!(Packet::decode(&bytes).is_err());

        let mut chunk = vec![FILE_CHUNK_DATA, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        chunk.extend(std::iter::repeat(0u8).take(MAX_FILE_CHUNK + 1));
        assert!(Packet::decode(&chunk).is_err());
    }

    #[test]
    fn unknown_tag_is_none() {
        assert_eq!(Packet::decode(&[0xEE, 1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn malformed_inputs_are_errors() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::Empty));
        assert!(Packet::decode(&[FILE_CHUNK_REQUEST, 1, 2]).is_err());
        assert!(Packet::decode(&[TYPING]).is_err());
        assert!(Packet::decode(&[NAME, 0xff, 0xfe]).is_err());
        assert!(Packet::decode(&[FILE_ANNOUNCE, 0xc1]).is_err());
    }

    #[test]
    fn lossy_classification() {
        assert!(Packet::Ping.is_lossy());
        assert!(Packet::CustomLossy(vec![1]).is_lossy());
        assert!(!Packet::CustomLossless(vec![1]).is_lossy());
        assert!(!Packet::Typing(false).is_lossy());
    }
}
