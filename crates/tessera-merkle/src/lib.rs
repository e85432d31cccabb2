//! Merkle tree primitives for verifiable append-only feeds.
//!
//! A feed's blocks are the leaves of a binary Merkle tree laid out with a
//! flat in-order numbering: leaf `p` sits at node index `2p`, branches at
//! the odd indices between them. The [`flat`] module provides the index
//! arithmetic, [`Node`] the `(index, hash, size)` triple a tree node
//! carries, and [`Generator`] the incremental construction used on append.
//!
//! All hashing is SHA-256 with single-byte domain prefixes so that leaf,
//! branch and root-set hashes can never be confused for one another:
//!
//! + `hash_leaf`:  `SHA256(0x00 || be64(len) || data)`
//! + `hash_parent`: `SHA256(0x01 || be64(size) || left || right)`
//! + `hash_roots`: `SHA256(0x02 || (hash || be64(index) || be64(size))*)`
//!
//! The length/size framing makes the tree second-preimage resistant across
//! block boundaries: a block is committed together with its length, and a
//! branch together with the total byte span of its subtree.
//!
//! # Usage
//! ```
//! use tessera_merkle::Generator;
//!
//! let mut generator = Generator::new();
//! let mut nodes = Vec::new();
//! for block in [&b"hello"[..], b"world"] {
//!     generator.next(block, &mut nodes);
//! }
//! assert_eq!(2, generator.blocks());
//! assert_eq!(10, generator.byte_length());
//! let anchor = generator.root_hash();
//! assert_ne!([0; 32], anchor);
//! ```
//!
//! # Further reading
//!
//! + RFC 6962 (certificate transparency trees): <https://datatracker.ietf.org/doc/html/rfc6962>
//! + Flat in-order trees: <https://mmapped.blog/posts/22-flat-in-order-trees>

use sha2::{
    Digest as _,
    Sha256,
};

pub mod flat;
mod generator;
mod node;

pub use generator::Generator;
pub use node::Node;

/// Domain prefix of leaf hashes.
pub const LEAF_DOMAIN: u8 = 0x00;
/// Domain prefix of branch hashes.
pub const PARENT_DOMAIN: u8 = 0x01;
/// Domain prefix of root-set hashes.
pub const ROOT_DOMAIN: u8 = 0x02;

/// Calculates `SHA256(0x00 || be64(len) || data)`, the hash of a leaf block.
#[must_use]
pub fn hash_leaf(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update((data.len() as u64).to_be_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

/// Calculates `SHA256(0x01 || be64(left.size + right.size) || left.hash || right.hash)`,
/// the hash of the branch joining two sibling subtrees.
///
/// # Panics
/// Panics if `left` does not precede `right`; the ordering is part of the
/// hashed message.
#[must_use]
pub fn hash_parent(left: &Node, right: &Node) -> [u8; 32] {
    assert!(left.index < right.index, "siblings must be hashed in index order");
    let mut hasher = Sha256::new();
    hasher.update([PARENT_DOMAIN]);
    hasher.update((left.size + right.size).to_be_bytes());
    hasher.update(left.hash);
    hasher.update(right.hash);
    hasher.finalize().into()
}

/// Calculates the hash summarizing a full-root set:
/// `SHA256(0x02 || (hash || be64(index) || be64(size))*)` over the roots in
/// ascending index order.
///
/// This is the message that feed signatures sign, and the value a finalized
/// feed uses as its key.
#[must_use]
pub fn hash_roots(roots: &[Node]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([ROOT_DOMAIN]);
    for root in roots {
        hasher.update(root.hash);
        hasher.update(root.index.to_be_bytes());
        hasher.update(root.size.to_be_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests;
