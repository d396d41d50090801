//! Long-term identities and shareable friend addresses.

use std::fmt;
use std::str::FromStr;

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::TransportError;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
const NOSPAM_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 2;
/// Public key, nospam and checksum.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Ember network identity — X25519 public key.
///
/// Displayed and parsed as uppercase hex. Serialized as raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransportError> {
        let array: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// First five bytes as hex, for log lines.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", self.fmt_short())
    }
}

impl FromStr for PublicKey {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransportError::InvalidKey(s.to_string()))?;
        Self::from_slice(&bytes).map_err(|_| TransportError::InvalidKey(s.to_string()))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// X25519 secret key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Generate a fresh secret from the operating system RNG.
    pub fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::OsRng;
        Self(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub const fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(X25519Public::from(&secret).to_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A secret key together with its public half.
#[derive(Clone, Debug)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }
}

/// Shareable friend address: public key, nospam and a 16-bit checksum.
///
/// The nospam value lets the owner invalidate previously shared
/// addresses; requests carrying a stale nospam are ignored. An address
/// with a bad checksum can be parsed but fails [`Address::is_valid`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    public_key: PublicKey,
    nospam: u32,
    checksum: u16,
}

impl Address {
    pub fn new(public_key: PublicKey, nospam: u32) -> Self {
        Self {
            public_key,
            nospam,
            checksum: checksum(&public_key, nospam),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn nospam(&self) -> u32 {
        self.nospam
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Whether the stored checksum matches key and nospam.
    pub fn is_valid(&self) -> bool {
        self.checksum == checksum(&self.public_key, self.nospam)
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.public_key.as_bytes());
        out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE].copy_from_slice(&self.nospam.to_be_bytes());
        out[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    /// Parse raw bytes. Only the length is checked here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(TransportError::InvalidAddress(format!(
                "expected {ADDRESS_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let public_key = PublicKey::from_slice(&bytes[..PUBLIC_KEY_SIZE])?;
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        let mut sum = [0u8; CHECKSUM_SIZE];
        sum.copy_from_slice(&bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..]);
        Ok(Self {
            public_key,
            nospam: u32::from_be_bytes(nospam),
            checksum: u16::from_be_bytes(sum),
        })
    }
}

fn checksum(public_key: &PublicKey, nospam: u32) -> u16 {
    let mut sum = [0u8; CHECKSUM_SIZE];
    let nospam = nospam.to_be_bytes();
    for (i, byte) in public_key.as_bytes().iter().chain(nospam.iter()).enumerate() {
        sum[i % CHECKSUM_SIZE] ^= byte;
    }
    u16::from_be_bytes(sum)
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_bytes()))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}.., nospam={:08x})", self.public_key.fmt_short(), self.nospam)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Self::from_bytes(&bytes)
    }
}
