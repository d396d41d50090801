/// Cryptographic primitives for Ember.
///
/// X25519 key agreement, HKDF-SHA256 derivation and XChaCha20-Poly1305
/// sealing. Every failure is reported as
/// [`CryptoError::AuthenticationFailed`]; nothing here panics on input.
///
/// Two key schedules exist:
/// - the *static* key, derived from both long-term identities, seals
///   handshake bodies;
/// - the *session* keys, derived from both ephemeral session keys, seal
///   channel traffic. One key per direction.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::{CryptoError, PublicKey, SecretKey};

/// HKDF info strings for domain separation.
const STATIC_INFO: &[u8] = b"ember-static-xchacha20poly1305-v1";
const SESSION_INFO: &[u8] = b"ember-session-xchacha20poly1305-v1";

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
/// Poly1305 authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

pub type Key = [u8; KEY_SIZE];
pub type Nonce = [u8; NONCE_SIZE];

/// Directional session keys negotiated by [`handshake`].
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub(crate) send: Key,
    pub(crate) recv: Key,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// X25519 agreement. Rejects low-order points.
fn agree(secret: &SecretKey, public: &PublicKey) -> Result<[u8; 32], CryptoError> {
    let secret = StaticSecret::from(secret.to_bytes());
    let shared = secret.diffie_hellman(&X25519Public::from(public.to_bytes()));
    if !shared.was_contributory() {
        return Err(CryptoError::AuthenticationFailed);
    }
    Ok(shared.to_bytes())
}

fn expand<const N: usize>(shared: &[u8; 32], info: &[u8]) -> Result<[u8; N], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; N];
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(okm)
}

/// Info string binding both identities, lower key first.
fn identity_info(prefix: &[u8], a: &PublicKey, b: &PublicKey) -> Vec<u8> {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut info = Vec::with_capacity(prefix.len() + 64);
    info.extend_from_slice(prefix);
    info.extend_from_slice(first.as_bytes());
    info.extend_from_slice(second.as_bytes());
    info
}

/// Key shared by two long-term identities. Symmetric: both sides derive
/// the same key.
pub fn static_key(local: &SecretKey, remote: &PublicKey) -> Result<Key, CryptoError> {
    let shared = agree(local, remote)?;
    let info = identity_info(STATIC_INFO, &local.public_key(), remote);
    expand::<KEY_SIZE>(&shared, &info)
}

/// Negotiate session keys from our ephemeral secret and the peer's
/// ephemeral public key, bound to both long-term identities.
///
/// The lower identity sends with the first half of the derived material.
pub fn handshake(
    local_session: &SecretKey,
    remote_session: &PublicKey,
    local_identity: &PublicKey,
    remote_identity: &PublicKey,
) -> Result<SessionKeys, CryptoError> {
    if local_identity == remote_identity {
        return Err(CryptoError::AuthenticationFailed);
    }
    let shared = agree(local_session, remote_session)?;
    let info = identity_info(SESSION_INFO, local_identity, remote_identity);
    let okm = expand::<{ KEY_SIZE * 2 }>(&shared, &info)?;

    let mut low = [0u8; KEY_SIZE];
    let mut high = [0u8; KEY_SIZE];
    low.copy_from_slice(&okm[..KEY_SIZE]);
    high.copy_from_slice(&okm[KEY_SIZE..]);

    Ok(if local_identity < remote_identity {
        SessionKeys { send: low, recv: high }
    } else {
        SessionKeys { send: high, recv: low }
    })
}

/// Encrypt with XChaCha20-Poly1305.
pub fn seal(key: &Key, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .encrypt(&XNonce::from(*nonce), plaintext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Decrypt and authenticate with XChaCha20-Poly1305.
pub fn open(key: &Key, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(&XNonce::from(*nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Random 24-byte nonce (safe for random generation with XChaCha20).
pub fn random_nonce() -> Nonce {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
