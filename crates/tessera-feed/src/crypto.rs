//! Key material and the keyed discovery hash.

use std::fmt::{
    self,
    Debug,
    Formatter,
};

use ed25519_consensus::SigningKey as Ed25519SigningKey;
pub use ed25519_consensus::{
    Signature,
    VerificationKey,
};
use hmac::{
    Hmac,
    Mac as _,
};
use rand::{
    CryptoRng,
    RngCore,
};
use sha2::Sha256;
use zeroize::{
    Zeroize,
    ZeroizeOnDrop,
};

/// Label hashed under a feed's public key to derive its discovery key.
pub const DISCOVERY_LABEL: &[u8] = b"tessera";

/// Byte length of the persisted secret key record (`seed || public key`).
pub const SECRET_KEY_RECORD_LEN: usize = 64;

/// An Ed25519 signing key.
// Refinement type around ed25519_consensus::SigningKey overriding its Debug
// implementation to not accidentally leak it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey(Ed25519SigningKey);

impl SigningKey {
    /// Generates a new signing key.
    pub fn new<R: RngCore + CryptoRng>(rng: R) -> Self {
        Self(Ed25519SigningKey::new(rng))
    }

    /// Creates a signature on `msg` using this key.
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.0.sign(msg)
    }

    /// Returns the verification key associated with this signing key.
    #[must_use]
    pub fn verification_key(&self) -> VerificationKey {
        self.0.verification_key()
    }

    /// Serializes the key into its 64-byte storage record,
    /// `seed || public key`.
    #[must_use]
    pub fn to_record(&self) -> [u8; SECRET_KEY_RECORD_LEN] {
        let mut record = [0; SECRET_KEY_RECORD_LEN];
        record[..32].copy_from_slice(self.0.as_bytes());
        record[32..].copy_from_slice(&self.0.verification_key().to_bytes());
        record
    }

    /// Parses a key from its 64-byte storage record.
    ///
    /// Returns `None` if the record is all zeros (no key stored) or if the
    /// embedded public key does not belong to the seed (corrupt record).
    #[must_use]
    pub fn from_record(record: &[u8; SECRET_KEY_RECORD_LEN]) -> Option<Self> {
        if record.iter().all(|&byte| byte == 0) {
            return None;
        }
        let seed: [u8; 32] = record[..32].try_into().expect("slice is 32 bytes");
        let key = Self(Ed25519SigningKey::from(seed));
        if key.0.verification_key().to_bytes() != record[32..] {
            return None;
        }
        Some(key)
    }
}

impl Debug for SigningKey {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        formatter
            .debug_struct("SigningKey")
            .field("verification_key", &self.0.verification_key())
            .finish_non_exhaustive() // avoids printing secret fields
    }
}

impl From<[u8; 32]> for SigningKey {
    fn from(seed: [u8; 32]) -> Self {
        Self(Ed25519SigningKey::from(seed))
    }
}

/// Derives the discovery key of the feed identified by `key`:
/// `HMAC-SHA256(key, "tessera")`.
///
/// The discovery key is safe to advertise: it identifies the feed to peers
/// that already know the public key while revealing nothing that lets others
/// recover it.
#[must_use]
pub fn discovery_key(key: &[u8; 32]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(DISCOVERY_LABEL);
    mac.finalize().into_bytes().into()
}
