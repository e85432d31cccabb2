//! Proof planning over the tree-node presence map.
//!
//! The functions here operate on the tree bits of a [`Bitfield`] and speak
//! purely in flat-tree indices; loading the actual node hashes from storage
//! is the feed's job. `digest` and `proof` are exact duals: a replica
//! summarizes what it already holds around an index as an opaque `u64`, and
//! the serving side consumes that summary to plan the minimum node set the
//! replica still needs.

use std::collections::BTreeSet;

use tessera_merkle::flat;

use crate::bitfield::Bitfield;

/// A planned proof: the node indices to ship, and the boundary requiring a
/// signature when the plan runs up to the current roots.
#[derive(Debug, PartialEq, Eq)]
pub struct ProofPlan {
    pub nodes: Vec<u64>,
    /// `Some(boundary)` when verification extends to the root set of a
    /// `boundary / 2`-block tree and therefore needs the matching
    /// signature; `None` when the replica's own trust anchor suffices.
    pub verified_by: Option<u64>,
}

/// Options for [`proof`].
#[derive(Debug, Default)]
pub struct ProofOptions {
    /// The requester's knowledge summary, from [`digest`].
    pub digest: u64,
    /// Include the leaf's own node in the plan (hash-only requests).
    pub include_hash: bool,
    /// Explicit set of tree indices the requester is known to hold,
    /// complementing `digest`.
    pub remote_tree: BTreeSet<u64>,
}

/// Marks tree index `i` as stored, propagating to every ancestor both of
/// whose children are now stored. Returns whether anything changed.
pub fn set(bits: &mut Bitfield, i: u64) -> bool {
    if !bits.tree_set(i, true) {
        return false;
    }
    let mut i = i;
    while bits.tree_get(flat::sibling(i)) {
        i = flat::parent(i);
        if !bits.tree_set(i, true) {
            break;
        }
    }
    true
}

/// Number of blocks in the verified frontier, used for length recovery on
/// open.
///
/// Climbs from node `0` to the smallest subtree covering every known tree
/// bit, remembering the highest stored ancestor, then resolves that
/// ancestor's verification boundary.
#[must_use]
pub fn blocks(bits: &Bitfield) -> u64 {
    let max = bits.tree_len();
    let mut top = 0;
    let mut next = 0;
    while flat::right_span(next) < max {
        next = flat::parent(next);
        if bits.tree_get(next) {
            top = next;
        }
    }
    if bits.tree_get(top) {
        verified_by(bits, top) / 2
    } else {
        0
    }
}

/// Finds the even node-index boundary of the tree that verifies node `i`:
/// the tree holds `boundary / 2` blocks, and on a live feed the signature
/// at slot `boundary / 2 - 1` covers all of them.
///
/// Walks up while both the parent and the sibling are stored, then expands
/// right and down along the ragged frontier to find the first absent leaf
/// position.
#[must_use]
pub fn verified_by(bits: &Bitfield, i: u64) -> u64 {
    if !bits.tree_get(i) {
        return 0;
    }

    // climb to the root of the stored subtree containing i
    let mut depth = flat::depth(i);
    let mut top = i;
    let mut parent = flat::parent(top);
    depth += 1;
    while bits.tree_get(parent) && bits.tree_get(flat::sibling(top)) {
        top = parent;
        parent = flat::parent(top);
        depth += 1;
    }
    depth -= 1;

    // expand right and down to the frontier
    while depth != 0 {
        top = flat::left_child(flat::index(depth, flat::offset(top) + 1));
        depth -= 1;
        while !bits.tree_get(top) && depth > 0 {
            top = flat::left_child(top);
            depth -= 1;
        }
    }

    if bits.tree_get(top) {
        top + 2
    } else {
        top
    }
}

/// Summarizes what this side holds around leaf-tree index `i` as an opaque
/// `u64` consumed by [`proof`] on the serving side.
///
/// Encoding: `1` means "`i` is already stored and verified here". Otherwise
/// bit `s + 1` records that the sibling at climb step `s` is stored; when an
/// ancestor itself is found stored at climb depth `d`, bit `0` is set and
/// bit `d + 1` marks the climb length. `0` means nothing useful is held.
#[must_use]
pub fn digest(bits: &Bitfield, i: u64) -> u64 {
    if bits.tree_get(i) {
        return 1;
    }
    let frontier = bits.tree_len();
    let mut digest = 0_u64;
    let mut bit = 2_u64;
    let mut next = i;
    loop {
        if bits.tree_get(flat::sibling(next)) {
            digest |= bit;
        }
        let parent = flat::parent(next);
        if bits.tree_get(parent) {
            return digest | (bit << 1) | 1;
        }
        if flat::left_span(parent) == 0 && flat::right_span(parent) + 2 >= frontier {
            // parent spans everything this side knows; nothing above helps
            return digest;
        }
        next = parent;
        bit <<= 1;
        if bit == 0 {
            return digest;
        }
    }
}

/// Expands a [`digest`] back into the set of tree indices the remote holds
/// around `i`.
fn apply_digest(remote: &mut BTreeSet<u64>, i: u64, digest: u64) {
    let has_anchor = digest & 1 == 1;
    let mask = digest >> 1;
    if mask == 0 {
        return;
    }
    let top_bit = 63 - mask.leading_zeros() as u64;
    let mut next = i;
    for step in 0..top_bit {
        if mask & (1 << step) != 0 {
            remote.insert(flat::sibling(next));
        }
        next = flat::parent(next);
    }
    if has_anchor {
        // the highest bit is the climb-length marker; the anchor is the
        // ancestor the climb stopped at
        remote.insert(next);
    } else if mask & (1 << top_bit) != 0 {
        remote.insert(flat::sibling(next));
    }
}

/// Plans the minimum proof for the block whose leaf sits at tree index `i`.
///
/// Returns `None` when node `i` is not stored locally. Otherwise walks
/// upward from `i`: every level's sibling is shipped unless the remote
/// already holds it; the walk stops early at a node the remote holds
/// (`verified_by: None`), or runs up to the current roots, in which case the
/// remaining full roots are shipped too and `verified_by` names the
/// signature boundary.
#[must_use]
pub fn proof(bits: &Bitfield, i: u64, opts: &ProofOptions) -> Option<ProofPlan> {
    if !bits.tree_get(i) {
        return None;
    }
    let mut nodes = Vec::new();
    if opts.include_hash {
        nodes.push(i);
    }
    if opts.digest == 1 {
        return Some(ProofPlan {
            nodes,
            verified_by: None,
        });
    }

    let mut remote = opts.remote_tree.clone();
    apply_digest(&mut remote, i, opts.digest);

    let mut next = i;
    loop {
        if remote.contains(&next) {
            return Some(ProofPlan {
                nodes,
                verified_by: None,
            });
        }
        let sibling = flat::sibling(next);
        if !bits.tree_get(sibling) {
            // ran past our stored frontier: anchor against the root set
            let boundary = verified_by(bits, i);
            for root in flat::full_roots(boundary) {
                if root != next && !remote.contains(&root) {
                    nodes.push(root);
                }
            }
            return Some(ProofPlan {
                nodes,
                verified_by: Some(boundary),
            });
        }
        if !remote.contains(&sibling) {
            nodes.push(sibling);
        }
        next = flat::parent(next);
    }
}
