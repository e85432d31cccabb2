use hex_literal::hex;

use crate::{
    hash_leaf,
    hash_parent,
    hash_roots,
    Generator,
    Node,
};

#[test]
fn hash_domains_do_not_collide() {
    // a leaf over 32 zero bytes must differ from a branch over zero-hash
    // children and from a root-set hash over a zero root, even though the
    // hashed payloads are superficially similar
    let leaf = hash_leaf(&[0; 32]);
    let zero = Node::new(0, [0; 32], 16);
    let two = Node::new(2, [0; 32], 16);
    let parent = hash_parent(&zero, &two);
    let roots = hash_roots(&[Node::new(0, [0; 32], 32)]);
    assert_ne!(leaf, parent);
    assert_ne!(leaf, roots);
    assert_ne!(parent, roots);
}

#[test]
fn leaf_hash_commits_to_length() {
    // same bytes, different framing
    assert_ne!(hash_leaf(b""), hash_leaf(&[0]));
}

#[test]
fn leaf_hash_vector() {
    // SHA256(00 || 0000000000000005 || "hello")
    assert_eq!(
        hex!("1f1d4ea728bc4c10bbc8211c7644aa950b6296c9b3e70d263e4ae6fc83e895e4"),
        hash_leaf(b"hello"),
    );
}

#[test]
#[should_panic(expected = "index order")]
fn hash_parent_rejects_swapped_siblings() {
    let left = Node::new(0, [1; 32], 1);
    let right = Node::new(2, [2; 32], 1);
    hash_parent(&right, &left);
}

#[test]
fn parent_hash_depends_on_child_order_and_sizes() {
    let a = Node::new(0, [1; 32], 1);
    let b = Node::new(2, [2; 32], 1);
    let b_large = Node::new(2, [2; 32], 2);
    assert_ne!(hash_parent(&a, &b), hash_parent(&a, &b_large));
}

#[test]
fn root_hash_changes_with_every_append() {
    let mut generator = Generator::new();
    let mut nodes = Vec::new();
    let mut seen = Vec::new();
    for block in 0..16_u64 {
        generator.next(&block.to_be_bytes(), &mut nodes);
        let hash = generator.root_hash();
        assert!(!seen.contains(&hash));
        seen.push(hash);
    }
}

#[test]
fn generator_parents_verify_against_hash_parent() {
    let mut generator = Generator::new();
    let mut nodes = Vec::new();
    for block in 0..8_u64 {
        generator.next(&block.to_be_bytes(), &mut nodes);
    }
    let find = |index: u64| {
        nodes
            .iter()
            .find(|node| node.index == index)
            .expect("node was produced")
            .clone()
    };
    for node in nodes.iter().filter(|node| !node.is_leaf()) {
        let left = find(crate::flat::left_child(node.index));
        let right = find(crate::flat::right_child(node.index));
        assert_eq!(node.hash, hash_parent(&left, &right));
        assert_eq!(node.size, left.size + right.size);
    }
}
