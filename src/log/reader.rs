use bytes::{Bytes, BytesMut};

use crate::{
    error::{Error, Result},
    options::Options,
    storage::LogStorage,
    utils::crc8::Crc8,
};

use super::{BlockHeader, HEADER_SIZE, SESSION_ID_ADDRESS};

/// Walks the flash log block by block for the sender.
///
/// Driver errors surface as `StorageRead` and are never retried here.
pub struct BlockReader<S> {
    storage: S,
    block_size: u64,
    max_payload: usize,
    // Start of the next block to read.
    cursor: u64,
    buf: BytesMut,
}

impl<S: LogStorage> BlockReader<S> {
    pub fn new(storage: S, options: &Options) -> Self {
        Self {
            storage,
            block_size: options.block_size() as u64,
            max_payload: options.max_payload(),
            cursor: options.block_address(0),
            buf: BytesMut::with_capacity(options.max_payload()),
        }
    }

    pub fn read_session_id(&mut self) -> Result<u8> {
        let mut id = [0u8; 1];
        self.read_raw(SESSION_ID_ADDRESS, &mut id)?;
        Ok(id[0])
    }

    /// Address the next `next_header` call reads from.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// True when a whole block starting at `address` lies inside storage.
    pub fn block_fits(&self, address: u64) -> bool {
        address
            .checked_add(self.block_size)
            .is_some_and(|end| end <= self.storage.capacity())
    }

    /// True when no further block fits under the cursor.
    pub fn at_end(&self) -> bool {
        !self.block_fits(self.cursor)
    }

    /// `None` when no intact header lives at `address`, including addresses
    /// whose block would run past the end of storage.
    pub fn read_header_at(&mut self, address: u64, crc: &Crc8) -> Result<Option<BlockHeader>> {
        if !self.block_fits(address) {
            tracing::debug!("No block fits at {:#x}, end of storage", address);
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_SIZE];
        self.read_raw(address, &mut raw)?;
        let header = BlockHeader::decode(&raw, crc);
        if header.is_none() {
            tracing::debug!("Header crc mismatch at {:#x}: {:02x?}", address, raw);
        }
        Ok(header)
    }

    /// Read the header under the cursor. The cursor only moves once the
    /// block's payload has been read.
    pub fn next_header(&mut self, crc: &Crc8) -> Result<Option<BlockHeader>> {
        self.read_header_at(self.cursor, crc)
    }

    /// Payload of the block at `address`. The length is checked against the
    /// payload bound before storage is touched.
    pub fn read_payload(&mut self, address: u64, length: usize) -> Result<Bytes> {
        if length > self.max_payload {
            return Err(Error::OversizedPayload {
                block: ((address / self.block_size).saturating_sub(1)) as u16,
                len: length,
                max: self.max_payload,
            });
        }

        let address = address + HEADER_SIZE as u64;
        self.buf.clear();
        self.buf.resize(length, 0);
        self.storage
            .read_at(address, &mut self.buf[..])
            .map_err(|source| Error::StorageRead { address, source })?;
        Ok(self.buf.split().freeze())
    }

    /// Read the payload that belongs to `header`, found under the cursor, and
    /// advance to the next block.
    pub fn next_payload(&mut self, header: &BlockHeader) -> Result<Bytes> {
        let payload = self.read_payload(self.cursor, header.payload_length as usize)?;
        self.cursor += self.block_size;
        Ok(payload)
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn read_raw(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.storage
            .read_at(address, buf)
            .map_err(|source| Error::StorageRead { address, source })
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use crate::{
        log::{writer::LogWriter, BlockHeader},
        options::Options,
        storage::{LogStorage, LogStorageMut, MemStorage},
    };

    use super::*;

    fn gen_payload(len: usize) -> Vec<u8> {
        let mut b = b'a';
        (0..len)
            .map(|_| {
                let v = b;
                b = (b - b'a' + 1) % 26 + b'a';
                v
            })
            .collect()
    }

    struct BrokenStorage;

    impl LogStorage for BrokenStorage {
        fn capacity(&self) -> u64 {
            1 << 20
        }

        fn read_at(&mut self, _address: u64, _buf: &mut [u8]) -> io::Result<()> {
            Err(io::Error::other("spi timeout"))
        }
    }

    #[test]
    fn read_blocks_in_order() -> anyhow::Result<()> {
        let options = Options::default();
        let crc = Crc8::default();
        let mut writer = LogWriter::new(MemStorage::new(8 * 512), &options);
        writer.start_session(42)?;
        writer.append(&gen_payload(100))?;
        writer.append(&gen_payload(506))?;

        let mut reader = BlockReader::new(writer.into_inner(), &options);
        assert_eq!(reader.read_session_id()?, 42);
        assert_eq!(reader.cursor(), 512);

        let header = reader.next_header(&crc)?.expect("block 0");
        assert_eq!(header, BlockHeader::new(42, 0, 100));
        assert_eq!(reader.next_payload(&header)?, gen_payload(100));
        assert_eq!(reader.cursor(), 1024);

        let header = reader.next_header(&crc)?.expect("block 1");
        assert_eq!(header, BlockHeader::new(42, 1, 506));
        assert_eq!(reader.next_payload(&header)?, gen_payload(506));

        assert_eq!(reader.next_header(&crc)?, None);
        Ok(())
    }

    #[test]
    fn header_past_capacity_is_absent() -> anyhow::Result<()> {
        let options = Options::default();
        let crc = Crc8::default();
        // Room for the session slot and a partial block only.
        let mut reader = BlockReader::new(MemStorage::new(512 + 100), &options);
        assert!(reader.at_end());
        assert!(reader.block_fits(0));
        assert!(!reader.block_fits(512));
        assert_eq!(reader.next_header(&crc)?, None);
        assert_eq!(reader.read_header_at(u64::MAX - 4, &crc)?, None);
        Ok(())
    }

    #[test]
    fn oversized_payload_is_rejected_before_reading() -> anyhow::Result<()> {
        let options = Options::default();
        let mut reader = BlockReader::new(BrokenStorage, &options);

        // The broken driver would fail any read, so an oversize error proves
        // storage was never touched.
        let err = reader.read_payload(512, 507).unwrap_err();
        assert!(
            matches!(
                err,
                Error::OversizedPayload {
                    block: 0,
                    len: 507,
                    max: 506
                }
            ),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn driver_failure_is_storage_read() {
        let options = Options::default();
        let crc = Crc8::default();
        let mut reader = BlockReader::new(BrokenStorage, &options);

        assert!(matches!(
            reader.read_session_id(),
            Err(Error::StorageRead { address: 0, .. })
        ));
        assert!(matches!(
            reader.next_header(&crc),
            Err(Error::StorageRead { address: 512, .. })
        ));
    }

    #[test]
    fn empty_payload_block() -> anyhow::Result<()> {
        let options = Options::default();
        let crc = Crc8::default();
        let mut storage = MemStorage::new(4 * 512);
        storage.write_at(0, &[3])?;
        storage.write_at(512, &BlockHeader::new(3, 0, 0).encode(&crc))?;

        let mut reader = BlockReader::new(storage, &options);
        let header = reader.next_header(&crc)?.expect("block 0");
        assert_eq!(header.payload_length, 0);
        assert!(reader.next_payload(&header)?.is_empty());
        assert_eq!(reader.cursor(), 1024);
        Ok(())
    }
}
