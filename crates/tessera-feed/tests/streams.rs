//! Read/write stream adapters.

use futures::StreamExt as _;
use tessera_feed::{
    Feed,
    FeedOptions,
    ReadStreamOptions,
};

#[tokio::test]
async fn read_stream_yields_the_requested_range() {
    let feed = Feed::in_memory(FeedOptions::default())
        .await
        .expect("in-memory feeds always open");
    feed.append_batch(&[&b"a"[..], b"b", b"c", b"d"])
        .await
        .expect("feed is writable");

    let collected: Vec<Vec<u8>> = feed
        .read_stream(ReadStreamOptions {
            start: 1,
            end: Some(3),
            ..ReadStreamOptions::default()
        })
        .map(|block| block.expect("blocks 1..3 are local"))
        .collect()
        .await;
    assert_eq!(vec![b"b".to_vec(), b"c".to_vec()], collected);
}

#[tokio::test]
async fn read_stream_without_end_stops_at_creation_length() {
    let feed = Feed::in_memory(FeedOptions::default())
        .await
        .expect("in-memory feeds always open");
    feed.append_batch(&[&b"a"[..], b"b"]).await.expect("feed is writable");

    let stream = feed.read_stream(ReadStreamOptions::default());
    feed.append(b"late").await.expect("feed is writable");
    let collected: Vec<Vec<u8>> = stream
        .map(|block| block.expect("blocks are local"))
        .collect()
        .await;
    // the block appended after creation is not part of the snapshot
    assert_eq!(vec![b"a".to_vec(), b"b".to_vec()], collected);
}

#[tokio::test]
async fn live_tail_stream_follows_appends() {
    let feed = Feed::in_memory(FeedOptions::default())
        .await
        .expect("in-memory feeds always open");
    feed.append(b"before").await.expect("feed is writable");

    let mut tail = feed.read_stream(ReadStreamOptions {
        live: true,
        tail: true,
        ..ReadStreamOptions::default()
    });
    let collector = tokio::spawn(async move {
        let first = tail.next().await.expect("live streams never end")?;
        let second = tail.next().await.expect("live streams never end")?;
        Ok::<_, tessera_feed::Error>((first, second))
    });
    tokio::task::yield_now().await;
    feed.append(b"one").await.expect("feed is writable");
    feed.append(b"two").await.expect("feed is writable");
    let (first, second) = collector
        .await
        .expect("collector does not panic")
        .expect("both blocks arrive");
    assert_eq!(b"one".to_vec(), first);
    assert_eq!(b"two".to_vec(), second);
}

#[tokio::test]
async fn write_stream_acknowledges_batches() {
    let feed = Feed::in_memory(FeedOptions::default())
        .await
        .expect("in-memory feeds always open");
    let writer = feed.write_stream();
    let first = writer.write(b"solo").await.expect("feed is writable");
    assert_eq!(0, first);
    let batch_start = writer
        .write_batch(&[&b"x"[..], b"y"])
        .await
        .expect("feed is writable");
    assert_eq!(1, batch_start);
    assert_eq!(3, feed.length());
    assert_eq!(b"y".to_vec(), feed.get(2).await.expect("block 2 is local"));
}
