//! The contract between a feed and the replication layer.
//!
//! The feed never constructs peers. A replicator registers each remote as a
//! [`Peer`] held through a [`std::sync::Weak`], and the feed notifies the
//! set after any change to its bitfield, selections or waiters that could
//! unblock a peer decision. Dropped peers fall out of the set during the
//! next notification pass; removing one never requires a scan by the
//! caller.

/// Announcement that a contiguous run of blocks became available locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Have {
    /// First block of the run.
    pub start: u64,
    /// Number of blocks in the run.
    pub length: u64,
}

/// A remote replica as seen by the feed.
///
/// Implementations are driven by the replication collaborator; the feed
/// only ever calls the notification methods below. All methods take `&self`
/// and must not block: they are invoked while the feed holds its state
/// lock.
pub trait Peer: Send + Sync {
    /// Selections or waiters changed; the peer should re-evaluate what to
    /// request.
    fn update(&self);

    /// Blocks became available locally.
    fn have(&self, have: &Have);

    /// The feed's byte length grew to `byte_length`.
    fn have_bytes(&self, byte_length: u64);
}
