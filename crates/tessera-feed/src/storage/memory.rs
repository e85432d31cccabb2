use std::io;

use async_trait::async_trait;

use super::RandomAccess;

/// A growable in-memory byte stream.
#[derive(Debug, Default)]
pub struct Memory {
    buffer: Vec<u8>,
}

#[async_trait]
impl RandomAccess for Memory {
    async fn read(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let start = usize::try_from(offset).expect("offset fits in memory addressing");
        let length = usize::try_from(length).expect("length fits in memory addressing");
        let end = start
            .checked_add(length)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        if end > self.buffer.len() {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(self.buffer[start..end].to_vec())
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset).expect("offset fits in memory addressing");
        let end = start + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Memory,
        RandomAccess as _,
    };

    #[tokio::test]
    async fn reads_past_the_end_are_not_found() {
        let mut memory = Memory::default();
        memory.write(0, b"abc").await.expect("write succeeds");
        assert!(memory.read(1, 3).await.is_err());
        assert_eq!(b"bc".to_vec(), memory.read(1, 2).await.expect("range is written"));
    }

    #[tokio::test]
    async fn gaps_are_zero_filled() {
        let mut memory = Memory::default();
        memory.write(4, b"x").await.expect("write succeeds");
        assert_eq!(vec![0, 0, 0, 0, b'x'], memory.read(0, 5).await.expect("range exists"));
    }
}
