//! Stream adapters over feed reads and writes.

use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use futures::Stream;

use crate::{
    feed::{
        Feed,
        GetOptions,
        ReadStreamOptions,
    },
    storage::RandomAccess,
    Result,
};

/// A lazy block stream over `[start, end)` with at most one outstanding
/// read.
///
/// Created by [`Feed::read_stream`]. A `live` stream with an open end
/// follows the feed's tail: it parks on the append signal instead of
/// terminating.
pub struct ReadStream {
    inner: Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>,
}

impl Stream for ReadStream {
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Forwards value batches into the feed's write queue, acknowledging
/// durability per batch.
///
/// Created by [`Feed::write_stream`].
pub struct WriteStream<T: RandomAccess> {
    feed: Feed<T>,
}

impl<T: RandomAccess> WriteStream<T> {
    /// Appends one value; resolves once the append is durable.
    pub async fn write(&self, value: &[u8]) -> Result<u64> {
        self.feed.append(value).await
    }

    /// Appends a batch atomically; resolves once the whole batch is
    /// durable.
    pub async fn write_batch(&self, values: &[impl AsRef<[u8]>]) -> Result<u64> {
        self.feed.append_batch(values).await
    }
}

impl<T: RandomAccess> Feed<T> {
    /// Produces blocks from `[start, end)`, lazily and in order.
    ///
    /// With `tail` the stream starts at the current length; with `live` and
    /// no explicit end it never terminates on its own and yields every
    /// block appended after creation.
    #[must_use]
    pub fn read_stream(&self, options: ReadStreamOptions) -> ReadStream {
        let feed = self.clone();
        let start = if options.tail {
            feed.length()
        } else {
            options.start
        };
        let end = match options.end {
            Some(end) => Some(end),
            None if options.live => None,
            None => Some(feed.length()),
        };
        let wait = options.wait || options.live;
        let timeout = options.timeout;
        let inner = futures::stream::try_unfold((feed, start), move |(feed, cursor)| {
            async move {
                if let Some(end) = end {
                    if cursor >= end {
                        return Ok(None);
                    }
                }
                let block = feed
                    .get_with(cursor, GetOptions {
                        wait,
                        timeout,
                    })
                    .await?;
                Ok(Some((block, (feed, cursor + 1))))
            }
        });
        ReadStream {
            inner: Box::pin(inner),
        }
    }

    /// A write handle that sequences batches through the atomic batcher.
    #[must_use]
    pub fn write_stream(&self) -> WriteStream<T> {
        WriteStream {
            feed: self.clone(),
        }
    }
}
