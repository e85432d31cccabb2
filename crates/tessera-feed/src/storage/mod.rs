//! Binding between feed state and a set of random-access byte streams.
//!
//! A feed persists across six logical streams, each owned exclusively by its
//! feed and addressed with fixed-width records:
//!
//! | stream       | record                                        |
//! |--------------|-----------------------------------------------|
//! | `data`       | blocks, concatenated                          |
//! | `tree`       | 40 bytes per tree index, `hash || be64(size)`  |
//! | `bitfield`   | 3328-byte page records                        |
//! | `signatures` | 64 bytes per leaf index                       |
//! | `key`        | one 32-byte record at offset 0                |
//! | `secret_key` | one 64-byte record at offset 0                |
//!
//! Data offsets are not stored anywhere: the byte offset of block `i` is the
//! summed size of the full-root nodes covering the first `i` leaves, read
//! back from the tree stream.

use std::io;

use async_trait::async_trait;
use tessera_merkle::{
    flat,
    Node,
};

use crate::{
    bitfield::PAGE_RECORD_LEN,
    crypto::{
        Signature,
        SECRET_KEY_RECORD_LEN,
    },
    Error,
    Result,
};

mod disk;
mod memory;

pub use disk::Disk;
pub use memory::Memory;

/// A random-access byte stream.
///
/// Reads of ranges that were never written must fail with
/// [`io::ErrorKind::NotFound`]; writes past the current end zero-fill the
/// gap. Ranges written twice return the latest bytes.
#[async_trait]
pub trait RandomAccess: Send + 'static {
    async fn read(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>>;
    async fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    async fn sync(&mut self) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// The six logical streams of one feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamId {
    Data,
    Tree,
    Bitfield,
    Signatures,
    Key,
    SecretKey,
}

impl StreamId {
    /// The conventional file name of this stream inside a feed directory.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Tree => "tree",
            Self::Bitfield => "bitfield",
            Self::Signatures => "signatures",
            Self::Key => "key",
            Self::SecretKey => "secret_key",
        }
    }

    const ALL: [Self; 6] = [
        Self::Data,
        Self::Tree,
        Self::Bitfield,
        Self::Signatures,
        Self::Key,
        Self::SecretKey,
    ];
}

/// Snapshot of the persisted state read once at open.
pub struct OpenState {
    pub key: Option<[u8; 32]>,
    pub secret_key: Option<[u8; SECRET_KEY_RECORD_LEN]>,
    pub bitfield_pages: Vec<Vec<u8>>,
}

/// Owns the six streams of one feed and translates record addresses.
pub struct Storage<T: RandomAccess> {
    data: T,
    tree: T,
    bitfield: T,
    signatures: T,
    key: T,
    secret_key: T,
}

impl<T: RandomAccess> Storage<T> {
    /// Builds a storage binding by asking `create` for each stream.
    pub fn new(mut create: impl FnMut(StreamId) -> T) -> Self {
        Self {
            data: create(StreamId::Data),
            tree: create(StreamId::Tree),
            bitfield: create(StreamId::Bitfield),
            signatures: create(StreamId::Signatures),
            key: create(StreamId::Key),
            secret_key: create(StreamId::SecretKey),
        }
    }

    /// Reads the persisted key material and every bitfield page.
    ///
    /// All-zero key records count as absent so that an overwritten feed
    /// opens as new.
    pub async fn open_state(&mut self) -> Result<OpenState> {
        let key = match self.key.read(0, 32).await {
            Ok(bytes) if bytes.iter().any(|&b| b != 0) => {
                Some(<[u8; 32]>::try_from(bytes.as_slice()).expect("read returned 32 bytes"))
            }
            Ok(_) => None,
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(Error::Storage(e)),
        };
        let secret_key = match self.secret_key.read(0, SECRET_KEY_RECORD_LEN as u64).await {
            Ok(bytes) if bytes.iter().any(|&b| b != 0) => Some(
                <[u8; SECRET_KEY_RECORD_LEN]>::try_from(bytes.as_slice())
                    .expect("read returned 64 bytes"),
            ),
            Ok(_) => None,
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(Error::Storage(e)),
        };

        let mut bitfield_pages = Vec::new();
        loop {
            let offset = bitfield_pages.len() as u64 * PAGE_RECORD_LEN as u64;
            match self.bitfield.read(offset, PAGE_RECORD_LEN as u64).await {
                Ok(record) => bitfield_pages.push(record),
                Err(e) if is_not_found(&e) => break,
                Err(e) => return Err(Error::Storage(e)),
            }
        }

        Ok(OpenState {
            key,
            secret_key,
            bitfield_pages,
        })
    }

    /// Reads the tree node at flat-tree `index`.
    ///
    /// An all-zero record means the slot was never written and surfaces as
    /// [`Error::NotFound`].
    pub async fn node(&mut self, index: u64) -> Result<Node> {
        let record = self
            .tree
            .read(index * Node::RECORD_LEN as u64, Node::RECORD_LEN as u64)
            .await
            .map_err(Error::from_storage)?;
        let record = <[u8; Node::RECORD_LEN]>::try_from(record.as_slice())
            .expect("read returned a full record");
        Node::from_record(index, &record).ok_or(Error::NotFound)
    }

    pub async fn put_node(&mut self, node: &Node) -> Result<()> {
        self.tree
            .write(node.index * Node::RECORD_LEN as u64, &node.to_record())
            .await
            .map_err(Error::Storage)
    }

    /// Resolves the byte offset and length of block `index` from the sizes
    /// of the full-root nodes covering the blocks before it.
    ///
    /// `cached` is consulted before the tree stream so that nodes still in
    /// flight inside a verify-and-write pipeline resolve too.
    pub async fn offset_and_size(&mut self, index: u64, cached: &[Node]) -> Result<(u64, u64)> {
        let mut offset = 0;
        for root in flat::full_roots(2 * index) {
            offset += self.cached_node(root, cached).await?.size;
        }
        let size = self.cached_node(2 * index, cached).await?.size;
        Ok((offset, size))
    }

    async fn cached_node(&mut self, index: u64, cached: &[Node]) -> Result<Node> {
        if let Some(node) = cached.iter().find(|node| node.index == index) {
            return Ok(node.clone());
        }
        self.node(index).await
    }

    /// Reads block `index` from the data stream.
    pub async fn data(&mut self, index: u64) -> Result<Vec<u8>> {
        let (offset, size) = self.offset_and_size(index, &[]).await?;
        self.data
            .read(offset, size)
            .await
            .map_err(Error::from_storage)
    }

    pub async fn put_data(&mut self, offset: u64, block: &[u8]) -> Result<()> {
        self.data.write(offset, block).await.map_err(Error::Storage)
    }

    /// Reads the signature at slot `index`; `Ok(None)` when the slot was
    /// never written.
    pub async fn signature(&mut self, index: u64) -> Result<Option<Signature>> {
        match self.signatures.read(index * 64, 64).await {
            Ok(record) if record.iter().any(|&b| b != 0) => {
                let record =
                    <[u8; 64]>::try_from(record.as_slice()).expect("read returned 64 bytes");
                Ok(Some(Signature::from(record)))
            }
            Ok(_) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::Storage(e)),
        }
    }

    pub async fn put_signature(&mut self, index: u64, signature: &Signature) -> Result<()> {
        self.signatures
            .write(index * 64, &signature.to_bytes())
            .await
            .map_err(Error::Storage)
    }

    pub async fn put_bitfield_page(&mut self, page_no: u64, record: &[u8]) -> Result<()> {
        self.bitfield
            .write(page_no * PAGE_RECORD_LEN as u64, record)
            .await
            .map_err(Error::Storage)
    }

    pub async fn put_key(&mut self, key: &[u8; 32]) -> Result<()> {
        self.key.write(0, key).await.map_err(Error::Storage)
    }

    pub async fn put_secret_key(
        &mut self,
        record: &[u8; SECRET_KEY_RECORD_LEN],
    ) -> Result<()> {
        self.secret_key.write(0, record).await.map_err(Error::Storage)
    }

    /// Zeroes key material and the given number of bitfield pages, making
    /// the store open as a fresh feed.
    pub async fn erase(&mut self, bitfield_pages: usize) -> Result<()> {
        self.key.write(0, &[0; 32]).await.map_err(Error::Storage)?;
        self.secret_key
            .write(0, &[0; SECRET_KEY_RECORD_LEN])
            .await
            .map_err(Error::Storage)?;
        let blank = vec![0; PAGE_RECORD_LEN];
        for page_no in 0..bitfield_pages {
            self.put_bitfield_page(page_no as u64, &blank).await?;
        }
        Ok(())
    }

    pub async fn sync_all(&mut self) -> Result<()> {
        for stream in self.streams() {
            stream.sync().await.map_err(Error::Storage)?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        for stream in self.streams() {
            stream.close().await.map_err(Error::Storage)?;
        }
        Ok(())
    }

    fn streams(&mut self) -> [&mut T; 6] {
        [
            &mut self.data,
            &mut self.tree,
            &mut self.bitfield,
            &mut self.signatures,
            &mut self.key,
            &mut self.secret_key,
        ]
    }
}

impl Storage<Memory> {
    /// An ephemeral storage binding for tests and caches.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(|_| Memory::default())
    }
}

impl Storage<Disk> {
    /// Opens (creating as needed) the six stream files inside `dir`.
    pub async fn open_in_dir(dir: impl AsRef<std::path::Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await.map_err(Error::Storage)?;
        let mut streams = Vec::with_capacity(StreamId::ALL.len());
        for id in StreamId::ALL {
            streams.push(Disk::open(dir.join(id.name())).await.map_err(Error::Storage)?);
        }
        let mut streams = streams.into_iter();
        Ok(Self {
            data: streams.next().expect("six streams were opened"),
            tree: streams.next().expect("six streams were opened"),
            bitfield: streams.next().expect("six streams were opened"),
            signatures: streams.next().expect("six streams were opened"),
            key: streams.next().expect("six streams were opened"),
            secret_key: streams.next().expect("six streams were opened"),
        })
    }
}

fn is_not_found(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use tessera_merkle::Node;

    use super::Storage;
    use crate::Error;

    #[tokio::test]
    async fn node_records_roundtrip() {
        let mut storage = Storage::in_memory();
        let node = Node::new(3, [9; 32], 77);
        storage.put_node(&node).await.expect("write succeeds");
        assert_eq!(node, storage.node(3).await.expect("node was written"));
        assert!(matches!(storage.node(2).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn unwritten_slots_between_records_read_as_missing() {
        let mut storage = Storage::in_memory();
        storage
            .put_node(&Node::new(4, [1; 32], 1))
            .await
            .expect("write succeeds");
        // slot 1 precedes slot 4 in the file, but was never written
        assert!(matches!(storage.node(1).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn data_offsets_follow_root_sizes() {
        let mut storage = Storage::in_memory();
        // three blocks of sizes 5, 3, 4: roots for index 2 are [1]
        storage
            .put_node(&Node::new(0, [1; 32], 5))
            .await
            .expect("write succeeds");
        storage
            .put_node(&Node::new(2, [2; 32], 3))
            .await
            .expect("write succeeds");
        storage
            .put_node(&Node::new(1, [3; 32], 8))
            .await
            .expect("write succeeds");
        storage
            .put_node(&Node::new(4, [4; 32], 4))
            .await
            .expect("write succeeds");
        let (offset, size) = storage
            .offset_and_size(2, &[])
            .await
            .expect("all nodes are stored");
        assert_eq!((8, 4), (offset, size));
        let (offset, size) = storage
            .offset_and_size(1, &[])
            .await
            .expect("all nodes are stored");
        assert_eq!((5, 3), (offset, size));
    }

    #[tokio::test]
    async fn signature_slots_distinguish_absent_from_stored() {
        let mut storage = Storage::in_memory();
        assert!(storage
            .signature(0)
            .await
            .expect("absent slot is not an error")
            .is_none());
        let key = crate::crypto::SigningKey::new(rand::rngs::OsRng);
        let signature = key.sign(b"message");
        storage
            .put_signature(2, &signature)
            .await
            .expect("write succeeds");
        let read = storage
            .signature(2)
            .await
            .expect("read succeeds")
            .expect("slot 2 was written");
        assert_eq!(signature.to_bytes(), read.to_bytes());
        // slot 0 is inside the file now, but still all zeros
        assert!(storage
            .signature(0)
            .await
            .expect("read succeeds")
            .is_none());
    }
}
