/// Raw datagram framing shared by UDP and relay paths.
///
/// ```text
/// HANDSHAKE  [0x01][sender pk 32][nonce 24][sealed HandshakeBody]
/// DATA       [0x02][sender pk 32][secure channel packet]
/// ```
///
/// Handshake bodies are sealed with the static key of the two long-term
/// identities, so only the intended recipient can open them and the
/// sender is authenticated.
use ember_transport::crypto::{self, Nonce, NONCE_SIZE};
use ember_transport::{CryptoError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Serialize};

pub const HANDSHAKE: u8 = 0x01;
pub const DATA: u8 = 0x02;

const HEADER: usize = 1 + PUBLIC_KEY_SIZE;

/// Friend request riding on a handshake to a stranger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBody {
    pub nospam: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody {
    /// Sender's ephemeral key for this connection attempt.
    pub session_key: PublicKey,
    pub recipient: PublicKey,
    pub request: Option<RequestBody>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Datagram<'a> {
    Handshake {
        sender: PublicKey,
        nonce: Nonce,
        sealed: &'a [u8],
    },
    Data {
        sender: PublicKey,
        packet: &'a [u8],
    },
}

impl Datagram<'_> {
    pub fn sender(&self) -> PublicKey {
        match self {
            Self::Handshake { sender, .. } | Self::Data { sender, .. } => *sender,
        }
    }
}

/// Split a raw datagram. `None` for unknown kinds and short input.
pub fn parse(bytes: &[u8]) -> Option<Datagram<'_>> {
    if bytes.len() < HEADER {
        return None;
    }
    let sender = PublicKey::from_slice(&bytes[1..HEADER]).ok()?;
    let rest = &bytes[HEADER..];
    match bytes[0] {
        HANDSHAKE => {
            if rest.len() < NONCE_SIZE {
                return None;
            }
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&rest[..NONCE_SIZE]);
            Some(Datagram::Handshake {
                sender,
                nonce,
                sealed: &rest[NONCE_SIZE..],
            })
        }
        DATA => Some(Datagram::Data {
            sender,
            packet: rest,
        }),
        _ => None,
    }
}

/// Build a sealed handshake datagram from `local` to `body.recipient`.
pub fn handshake(local: &SecretKey, body: &HandshakeBody) -> Result<Vec<u8>, CryptoError> {
    let key = crypto::static_key(local, &body.recipient)?;
    let plain = rmp_serde::to_vec(body).map_err(|_| CryptoError::AuthenticationFailed)?;
    let nonce = crypto::random_nonce();
    let sealed = crypto::seal(&key, &nonce, &plain)?;

    let mut out = Vec::with_capacity(HEADER + NONCE_SIZE + sealed.len());
    out.push(HANDSHAKE);
    out.extend_from_slice(local.public_key().as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open a handshake from `sender`. Fails on bad authentication, an
/// undecodable body, or a body addressed to someone else.
pub fn open_handshake(
    local: &SecretKey,
    sender: &PublicKey,
    nonce: &Nonce,
    sealed: &[u8],
) -> Result<HandshakeBody, CryptoError> {
    let key = crypto::static_key(local, sender)?;
    let plain = crypto::open(&key, nonce, sealed)?;
    let body: HandshakeBody =
        rmp_serde::from_slice(&plain).map_err(|_| CryptoError::AuthenticationFailed)?;
    if body.recipient != local.public_key() {
        return Err(CryptoError::AuthenticationFailed);
    }
    Ok(body)
}

/// Frame a secure channel packet.
pub fn data(sender: &PublicKey, packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER + packet.len());
    out.push(DATA);
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(packet);
    out
}
