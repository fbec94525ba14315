//! Synchronous seam over the non-volatile memory driver.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use bytes::BytesMut;

use crate::log::ERASED;

/// Read side of the flash driver, owned by the sender for a transfer.
pub trait LogStorage {
    fn capacity(&self) -> u64;

    /// Fill `buf` from `address`. Any error is a driver fault.
    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Write side, used by the logging subsystem.
pub trait LogStorageMut: LogStorage {
    fn write_at(&mut self, address: u64, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn check_range(capacity: u64, address: u64, len: usize) -> io::Result<()> {
    match address.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "access of {} bytes at {:#x} past capacity {:#x}",
                len, address, capacity
            ),
        )),
    }
}

/// Flash image held in memory, erased to `0xFF`.
#[derive(Debug, Clone)]
pub struct MemStorage {
    data: BytesMut,
}

impl MemStorage {
    pub fn new(capacity: usize) -> Self {
        let mut data = BytesMut::with_capacity(capacity);
        data.resize(capacity, ERASED);
        Self { data }
    }

    pub fn from_image(image: &[u8]) -> Self {
        Self {
            data: BytesMut::from(image),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn erase(&mut self) {
        self.data.fill(ERASED);
    }
}

impl LogStorage for MemStorage {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self.capacity(), address, buf.len())?;
        let start = address as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

impl LogStorageMut for MemStorage {
    fn write_at(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        check_range(self.capacity(), address, data.len())?;
        let start = address as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Flash image backed by a file, e.g. a raw dump of the memory chip.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    capacity: u64,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        Self::from_file(file)
    }

    /// Create a new erased image of `capacity` bytes. Fails if `path` exists.
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let erased = [ERASED; 4096];
        let mut remain = capacity;
        while remain > 0 {
            let n = remain.min(erased.len() as u64) as usize;
            file.write_all(&erased[..n])?;
            remain -= n as u64;
        }
        file.flush()?;

        Ok(Self { file, capacity })
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let capacity = file.metadata()?.len();
        Ok(Self { file, capacity })
    }
}

impl LogStorage for FileStorage {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self.capacity, address, buf.len())?;
        self.file.seek(SeekFrom::Start(address))?;
        self.file.read_exact(buf)
    }
}

impl LogStorageMut for FileStorage {
    fn write_at(&mut self, address: u64, data: &[u8]) -> io::Result<()> {
        check_range(self.capacity, address, data.len())?;
        self.file.seek(SeekFrom::Start(address))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::{tempdir, tempfile};

    use super::*;

    #[test]
    fn mem_storage_starts_erased() -> anyhow::Result<()> {
        let mut storage = MemStorage::new(64);
        assert_eq!(storage.capacity(), 64);

        let mut buf = [0u8; 8];
        storage.read_at(56, &mut buf)?;
        assert_eq!(buf, [ERASED; 8]);
        Ok(())
    }

    #[test]
    fn mem_storage_write_read() -> anyhow::Result<()> {
        let mut storage = MemStorage::new(64);
        storage.write_at(10, b"flash")?;

        let mut buf = [0u8; 5];
        storage.read_at(10, &mut buf)?;
        assert_eq!(&buf, b"flash");

        storage.erase();
        storage.read_at(10, &mut buf)?;
        assert_eq!(buf, [ERASED; 5]);
        Ok(())
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut storage = MemStorage::new(16);
        let mut buf = [0u8; 4];
        let err = storage.read_at(14, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(storage.write_at(u64::MAX, b"x").is_err());
    }

    #[test]
    fn file_storage_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("flash.img");

        let mut storage = FileStorage::create(&path, 10_000)?;
        assert_eq!(storage.capacity(), 10_000);
        storage.write_at(9_000, b"tail")?;
        storage.flush()?;
        drop(storage);

        let mut storage = FileStorage::open(&path)?;
        let mut buf = [0u8; 6];
        storage.read_at(8_999, &mut buf)?;
        assert_eq!(&buf, &[ERASED, b't', b'a', b'i', b'l', ERASED]);

        assert!(FileStorage::create(&path, 16).is_err());
        Ok(())
    }

    #[test]
    fn file_storage_from_file() -> anyhow::Result<()> {
        let mut file = tempfile()?;
        file.write_all(&[1, 2, 3, 4])?;

        let mut storage = FileStorage::from_file(file)?;
        assert_eq!(storage.capacity(), 4);
        let mut buf = [0u8; 2];
        storage.read_at(2, &mut buf)?;
        assert_eq!(buf, [3, 4]);
        Ok(())
    }
}
