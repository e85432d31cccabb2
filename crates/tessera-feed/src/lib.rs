//! A cryptographically verifiable, append-only log over pluggable
//! random-access storage.
//!
//! Each feed is a sequence of opaque blocks forming the leaves of a Merkle
//! tree; readers verify any block against the feed's 32-byte public key
//! without trusting the storage or the peer that served it. A *live* feed
//! grows under Ed25519 signatures over its evolving root set; a *finalized*
//! feed anchors trust by its key equalling the hash of a fixed root set.
//!
//! The crate covers the integrity engine: proof generation and
//! verification, the append/put write pipeline, the on-disk layout (blocks,
//! tree nodes, signatures, bitfield pages), and the selection/waiting
//! machinery replication layers build on. The wire protocol between peers
//! is out of scope; see [`Peer`] for the notification contract a
//! replicator plugs into.
//!
//! # Example
//! ```
//! # tokio::runtime::Builder::new_current_thread()
//! #     .enable_all()
//! #     .build()
//! #     .unwrap()
//! #     .block_on(async {
//! use tessera_feed::{
//!     Feed,
//!     FeedOptions,
//! };
//!
//! let feed = Feed::in_memory(FeedOptions::default())
//!     .await
//!     .expect("in-memory feeds always open");
//! feed.append(b"hello").await.expect("feed is writable");
//! feed.append(b"world").await.expect("feed is writable");
//! assert_eq!(2, feed.length());
//! assert_eq!(10, feed.byte_length());
//! assert_eq!(b"world".to_vec(), feed.get(1).await.expect("block 1 is local"));
//!
//! // any replica holding only the public key can verify served blocks
//! let proof = feed.proof(0).await.expect("block 0 is local");
//! assert!(proof.signature.is_some());
//! # });
//! ```

mod bitfield;
pub mod codec;
pub mod crypto;
mod error;
mod feed;
mod options;
pub mod peer;
mod proof;
pub mod storage;
mod stream;
mod tree_index;

pub use codec::{
    Codec,
    ValueEncoding,
};
pub use error::{
    Error,
    Result,
};
pub use feed::{
    AuditReport,
    Download,
    DownloadOptions,
    Feed,
    FeedLength,
    GetOptions,
    ReadStreamOptions,
    SelectionInfo,
};
pub use options::FeedOptions;
pub use peer::{
    Have,
    Peer,
};
pub use proof::Proof;
pub use stream::{
    ReadStream,
    WriteStream,
};
pub use tessera_merkle::Node;
pub use tree_index::ProofOptions;
