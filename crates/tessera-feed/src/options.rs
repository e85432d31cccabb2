use crate::{
    codec::ValueEncoding,
    crypto::SigningKey,
};

/// Options recognized at feed creation.
///
/// The defaults describe a locally writable feed: live, eager downloads,
/// create-if-missing, binary values.
#[derive(Debug)]
pub struct FeedOptions {
    /// Do not auto-register an open-ended download of the whole feed.
    pub sparse: bool,
    /// Sign appended blocks so the feed can keep growing under its key.
    /// With `live` unset the feed accumulates unsigned blocks and is meant
    /// to be sealed with `finalize`.
    pub live: bool,
    /// Suppress writing block data; callers maintain an external store and
    /// only the tree and signatures are persisted.
    pub indexing: bool,
    /// Generate a key pair when the storage holds none.
    pub create_if_missing: bool,
    /// Zero the bitfield and key material before opening.
    pub overwrite: bool,
    /// Codec applied between caller values and stored blocks.
    pub value_encoding: ValueEncoding,
    /// Expected public key. Opening storage that holds a different key
    /// fails with `AlreadyExists`; opening empty storage adopts this key
    /// (a read-only replica).
    pub key: Option<[u8; 32]>,
    /// Secret key matching `key`, making the replica writable.
    pub secret_key: Option<SigningKey>,
    /// 32-byte local identity used by replication for peer dedup.
    /// Random when omitted.
    pub id: Option<[u8; 32]>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            sparse: false,
            live: true,
            indexing: false,
            create_if_missing: true,
            overwrite: false,
            value_encoding: ValueEncoding::default(),
            key: None,
            secret_key: None,
            id: None,
        }
    }
}

impl FeedOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for replicating the feed identified by `key` without write
    /// access.
    #[must_use]
    pub fn replica(key: [u8; 32]) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }
}
