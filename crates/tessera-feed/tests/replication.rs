//! Proof generation and verify-and-absorb across two feeds.

use tessera_feed::{
    storage::Memory,
    Error,
    Feed,
    FeedOptions,
    GetOptions,
    ProofOptions,
};

async fn writer_with_blocks(blocks: &[&[u8]]) -> Feed<Memory> {
    let feed = Feed::in_memory(FeedOptions::default())
        .await
        .expect("in-memory feeds always open");
    feed.append_batch(blocks).await.expect("feed is writable");
    feed
}

async fn replica_of(writer: &Feed<Memory>) -> Feed<Memory> {
    Feed::in_memory(FeedOptions::replica(writer.key().await))
        .await
        .expect("in-memory feeds always open")
}

#[tokio::test]
async fn replicate_all_blocks_via_proofs() {
    let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
    let writer = writer_with_blocks(&blocks).await;
    let replica = replica_of(&writer).await;

    for (index, block) in blocks.iter().enumerate() {
        let proof = writer.proof(index as u64).await.expect("writer holds every block");
        replica
            .put(index as u64, block.to_vec(), proof)
            .await
            .expect("proof verifies");
    }

    assert_eq!(8, replica.length());
    assert_eq!(8, replica.byte_length());
    for index in 0..8 {
        assert!(replica.has(index).await, "bit {index} is set");
    }
    assert_eq!(b"d".to_vec(), replica.get(3).await.expect("block 3 was absorbed"));
    assert!(replica.is_live().await, "a verified signature promotes the feed");
}

#[tokio::test]
async fn a_single_put_extends_length_to_the_signed_boundary() {
    let writer = writer_with_blocks(&[&b"only"[..]]).await;
    let replica = replica_of(&writer).await;
    let proof = writer.proof(0).await.expect("writer holds block 0");
    replica
        .put(0, b"only".to_vec(), proof)
        .await
        .expect("proof verifies");
    assert_eq!(1, replica.length());
    assert_eq!(4, replica.byte_length());
}

#[tokio::test]
async fn out_of_order_replication_verifies_each_block() {
    let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
    let writer = writer_with_blocks(&blocks).await;
    let replica = replica_of(&writer).await;

    for index in [7_u64, 2, 5, 0, 3, 6, 1, 4] {
        let proof = writer.proof(index).await.expect("writer holds every block");
        replica
            .put(index, blocks[index as usize].to_vec(), proof)
            .await
            .expect("proof verifies out of order");
    }
    assert_eq!(8, replica.length());
    for index in 0..8 {
        assert_eq!(
            blocks[index as usize].to_vec(),
            replica.get(index).await.expect("block was absorbed"),
        );
    }
}

#[tokio::test]
async fn put_is_idempotent() {
    let writer = writer_with_blocks(&[&b"a"[..], b"b"]).await;
    let replica = replica_of(&writer).await;
    let proof = writer.proof(0).await.expect("writer holds block 0");
    replica
        .put(0, b"a".to_vec(), proof.clone())
        .await
        .expect("first put verifies");
    replica
        .put(0, b"a".to_vec(), proof)
        .await
        .expect("second identical put succeeds");
    assert_eq!(b"a".to_vec(), replica.get(0).await.expect("block 0 is stored"));
}

#[tokio::test]
async fn tampered_block_is_rejected_by_a_fresh_replica() {
    let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
    let writer = writer_with_blocks(&blocks).await;
    let replica = replica_of(&writer).await;

    let proof = writer.proof(3).await.expect("writer holds block 3");
    let outcome = replica.put(3, b"X".to_vec(), proof).await;
    assert!(matches!(
        outcome,
        Err(Error::InvalidProof | Error::ChecksumFailed),
    ));
    assert_eq!(0, replica.length());
    assert!(!replica.has(3).await);
}

#[tokio::test]
async fn tampered_block_is_rejected_against_local_trust() {
    let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
    let writer = writer_with_blocks(&blocks).await;
    let replica = replica_of(&writer).await;

    for index in 0..3_u64 {
        let proof = writer.proof(index).await.expect("writer holds the block");
        replica
            .put(index, blocks[index as usize].to_vec(), proof)
            .await
            .expect("honest puts verify");
    }
    let proof = writer.proof(3).await.expect("writer holds block 3");
    let outcome = replica.put(3, b"X".to_vec(), proof).await;
    assert!(matches!(
        outcome,
        Err(Error::InvalidProof | Error::ChecksumFailed),
    ));
    let length_before = replica.length();
    assert!(!replica.has(3).await);
    assert_eq!(length_before, replica.length(), "length is unchanged");
}

#[tokio::test]
async fn tampered_proof_node_is_rejected() {
    let writer = writer_with_blocks(&[&b"a"[..], b"b", b"c", b"d"]).await;
    let replica = replica_of(&writer).await;
    let mut proof = writer.proof(0).await.expect("writer holds block 0");
    proof.nodes[0].hash[0] ^= 0xff;
    let outcome = replica.put(0, b"a".to_vec(), proof).await;
    assert!(matches!(
        outcome,
        Err(Error::InvalidProof | Error::ChecksumFailed),
    ));
    assert_eq!(0, replica.length());
}

#[tokio::test]
async fn replica_serves_reads_from_absorbed_blocks() {
    let writer = writer_with_blocks(&[&b"alpha"[..], b"beta", b"gamma"]).await;
    let replica = replica_of(&writer).await;
    for index in 0..3_u64 {
        let proof = writer.proof(index).await.expect("writer holds the block");
        let block = writer.get(index).await.expect("writer reads its own block");
        replica.put(index, block, proof).await.expect("proof verifies");
    }
    assert_eq!((0, 0), replica.seek(0).await.expect("offset 0 resolves"));
    assert_eq!((1, 2), replica.seek(7).await.expect("offset 7 is inside block 1"));
    assert_eq!(
        b"gamma".to_vec(),
        replica.get(2).await.expect("block 2 was absorbed"),
    );
}

#[tokio::test]
async fn digests_prune_already_held_nodes_from_proofs() {
    let blocks: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"];
    let writer = writer_with_blocks(&blocks).await;
    let replica = replica_of(&writer).await;
    for index in 0..4_u64 {
        let proof = writer.proof(index).await.expect("writer holds the block");
        replica
            .put(index, blocks[index as usize].to_vec(), proof)
            .await
            .expect("proof verifies");
    }

    // the replica now holds the left half of the tree; a digest-driven
    // proof for block 5 must not re-ship any of it
    let digest = replica.digest(5).await;
    let pruned = writer
        .proof_with(5, ProofOptions {
            digest,
            ..ProofOptions::default()
        })
        .await
        .expect("writer holds block 5");
    let full = writer.proof(5).await.expect("writer holds block 5");
    assert!(pruned.nodes.len() < full.nodes.len());
    replica
        .put(5, blocks[5].to_vec(), pruned)
        .await
        .expect("the pruned proof still verifies");
}

#[tokio::test]
async fn hash_only_proofs_carry_the_leaf_node() {
    let writer = writer_with_blocks(&[&b"a"[..], b"b"]).await;
    let proof = writer
        .proof_with(1, ProofOptions {
            include_hash: true,
            ..ProofOptions::default()
        })
        .await
        .expect("writer holds block 1");
    assert!(proof.nodes.iter().any(|node| node.index == 2));
}

#[tokio::test]
async fn finalized_feeds_verify_by_root_equality() {
    let writer = Feed::in_memory(FeedOptions {
        live: false,
        ..FeedOptions::default()
    })
    .await
    .expect("in-memory feeds always open");
    writer.append(b"x").await.expect("feed is writable");
    writer.finalize().await.expect("finalize succeeds");

    let proof = writer.proof(0).await.expect("writer holds block 0");
    assert!(proof.signature.is_none(), "finalized feeds carry no signatures");

    let replica = replica_of(&writer).await;
    replica
        .put(0, b"x".to_vec(), proof)
        .await
        .expect("root equality verifies the block");
    assert_eq!(b"x".to_vec(), replica.get(0).await.expect("block 0 was absorbed"));

    let tampered = writer.proof(0).await.expect("writer holds block 0");
    let fresh = replica_of(&writer).await;
    assert!(matches!(
        fresh.put(0, b"y".to_vec(), tampered).await,
        Err(Error::InvalidProof | Error::ChecksumFailed),
    ));
}

#[tokio::test]
async fn detached_signatures_verify_over_root_sets() {
    let writer = writer_with_blocks(&[&b"a"[..], b"b", b"c"]).await;
    let signature = writer.signature(2).await.expect("slot 2 holds a signature");
    writer
        .verify(2, &signature)
        .await
        .expect("signature covers the first three blocks");
    let earlier = writer.signature(0).await.expect("slot 0 holds a signature");
    writer
        .verify(0, &earlier)
        .await
        .expect("per-leaf signatures cover every prefix");
    assert!(matches!(
        writer.verify(2, &earlier).await,
        Err(Error::InvalidProof),
    ));
}

#[tokio::test]
async fn replica_waits_for_blocks_served_by_put() {
    let writer = writer_with_blocks(&[&b"slow"[..]]).await;
    let replica = replica_of(&writer).await;
    let reading = {
        let replica = replica.clone();
        tokio::spawn(async move {
            replica
                .get_with(0, GetOptions {
                    wait: true,
                    timeout: None,
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    let proof = writer.proof(0).await.expect("writer holds block 0");
    replica
        .put(0, b"slow".to_vec(), proof)
        .await
        .expect("proof verifies");
    let block = reading
        .await
        .expect("reader task does not panic")
        .expect("the put resolved the waiter");
    assert_eq!(b"slow".to_vec(), block);
}
