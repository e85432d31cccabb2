use tessera_merkle::Node;

use crate::crypto::Signature;

/// The material a replica needs to verify one block against the feed key.
///
/// `nodes` holds the sibling hashes along the climb from the block's leaf,
/// followed by any further full roots of the tree boundary the proof runs
/// up to. `signature` is present exactly when that boundary requires one:
/// proofs that stop at a subtree the replica already trusts carry none.
#[derive(Clone, Debug)]
pub struct Proof {
    pub nodes: Vec<Node>,
    pub signature: Option<Signature>,
}

impl Proof {
    /// Flat-tree indices of the carried nodes, in shipping order.
    #[must_use]
    pub fn node_indices(&self) -> Vec<u64> {
        self.nodes.iter().map(|node| node.index).collect()
    }
}
