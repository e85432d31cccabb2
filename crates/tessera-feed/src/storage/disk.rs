use std::{
    io,
    path::Path,
};

use async_trait::async_trait;
use tokio::{
    fs::{
        File,
        OpenOptions,
    },
    io::{
        AsyncReadExt as _,
        AsyncSeekExt as _,
        AsyncWriteExt as _,
    },
};

use super::RandomAccess;

/// A single stream file on disk.
///
/// Writes past the end of the file leave a zero-filled hole, which matches
/// the all-zero-record-means-absent convention of the tree and signature
/// streams.
#[derive(Debug)]
pub struct Disk {
    file: File,
}

impl Disk {
    /// Opens `path` read-write, creating it if missing.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
        })
    }
}

#[async_trait]
impl RandomAccess for Disk {
    async fn read(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0; usize::try_from(length).expect("length fits in a buffer")];
        match self.file.read_exact(&mut buffer).await {
            Ok(_) => Ok(buffer),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(io::ErrorKind::NotFound.into())
            }
            Err(e) => Err(e),
        }
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Disk,
        RandomAccess as _,
    };

    #[tokio::test]
    async fn reopening_preserves_written_ranges() {
        let dir = tempfile::tempdir().expect("tempdir is creatable");
        let path = dir.path().join("stream");
        {
            let mut disk = Disk::open(&path).await.expect("file opens");
            disk.write(8, b"persisted").await.expect("write succeeds");
            disk.close().await.expect("close succeeds");
        }
        let mut disk = Disk::open(&path).await.expect("file reopens");
        assert_eq!(
            b"persisted".to_vec(),
            disk.read(8, 9).await.expect("range was written"),
        );
        assert_eq!(vec![0; 8], disk.read(0, 8).await.expect("hole reads as zeros"));
        assert!(disk.read(10, 9).await.is_err());
    }
}
