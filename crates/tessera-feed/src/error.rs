use std::io;

/// Convenience alias for feed operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced at the feed boundary.
///
/// Recoverable conditions (a missing block under a waiting `get`, a bitfield
/// flush retried by the coalescing loop) never reach callers as errors; what
/// does reach them is listed here and always leaves feed state unchanged,
/// with the single exception of [`Error::Critical`] which poisons the feed
/// against further mutation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no record was found at the requested location")]
    NotFound,
    #[error("another feed is stored here; its key does not match the requested key")]
    AlreadyExists,
    #[error("the feed is not writable")]
    NotWritable,
    #[error("the proof does not verify the block against the feed key")]
    InvalidProof,
    #[error("verifying the proof requires a signature, but none was provided or stored")]
    MissingSignature,
    #[error("a reconstructed hash disagrees with a trusted node")]
    ChecksumFailed,
    #[error("the requested position lies outside the feed")]
    OutOfBounds,
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("the operation timed out")]
    Timeout,
    #[error("the feed is closed")]
    Closed,
    #[error(
        "cryptographically verified data disagrees with locally committed tree nodes; \
         refusing further mutation of this feed"
    )]
    Critical,
    #[error("storage operation failed")]
    Storage(#[source] io::Error),
    #[error("failed encoding or decoding a value")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Maps a storage error, turning reads past end-of-file into
    /// [`Error::NotFound`].
    pub(crate) fn from_storage(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof => Self::NotFound,
            _ => Self::Storage(error),
        }
    }

    /// Returns `true` for the missing-record case, which callers routinely
    /// turn into a wait or a remote request rather than a failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
