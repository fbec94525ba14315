use bytes::BufMut;

use crate::{
    error::{Error, Result},
    options::Options,
    storage::LogStorageMut,
    utils::crc8::Crc8,
};

use super::{BlockHeader, ERASED, SESSION_ID_ADDRESS};

/// Appends blocks for the current session.
///
/// Every block is written whole (header, payload, erased padding), so a
/// power cut leaves at worst one torn block whose header fails its crc.
pub struct LogWriter<S> {
    storage: S,
    crc: Crc8,
    block_size: usize,
    max_payload: usize,

    session_id: u8,
    // Number of the next block to write, `None` once 0xFFFF was written.
    next_block: Option<u16>,
    buf: Vec<u8>,
}

impl<S: LogStorageMut> LogWriter<S> {
    pub fn new(storage: S, options: &Options) -> Self {
        Self {
            storage,
            crc: Crc8::default(),
            block_size: options.block_size(),
            max_payload: options.max_payload(),
            session_id: 0,
            next_block: Some(0),
            buf: Vec::with_capacity(options.block_size()),
        }
    }

    /// Record a new session id and restart block numbering. Blocks of the
    /// previous session stay on flash and are cut off by the id change.
    pub fn start_session(&mut self, session_id: u8) -> Result<()> {
        self.storage.write_at(SESSION_ID_ADDRESS, &[session_id])?;
        self.session_id = session_id;
        self.next_block = Some(0);
        tracing::debug!("Start session {}", session_id);
        Ok(())
    }

    /// Continue the session already recorded on flash after `blocks` blocks.
    pub fn resume_session(&mut self, session_id: u8, blocks: u16) {
        self.session_id = session_id;
        self.next_block = Some(blocks);
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// Blocks written in this session so far.
    pub fn blocks(&self) -> u32 {
        match self.next_block {
            Some(n) => n as u32,
            None => u16::MAX as u32 + 1,
        }
    }

    /// Append `data`, split into as many blocks as needed. Empty data still
    /// produces one block with an empty payload.
    ///
    /// Nothing is written unless every block fits, both on flash and in the
    /// session's block numbering.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_room(data.len().div_ceil(self.max_payload).max(1))?;

        if data.is_empty() {
            return self.write_block(&[]);
        }

        for payload in data.chunks(self.max_payload) {
            self.write_block(payload)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn ensure_room(&self, blocks: usize) -> Result<()> {
        let first = self.next_block.ok_or_else(|| {
            Error::Protocol("block numbers exhausted for this session".into())
        })?;

        let last = first as u64 + blocks as u64 - 1;
        if last > u16::MAX as u64 {
            return Err(Error::Protocol(format!(
                "{} blocks from block {} run past the last block number",
                blocks, first
            )));
        }

        let end = (last + 2) * self.block_size as u64;
        if end > self.storage.capacity() {
            return Err(Error::Protocol(format!(
                "storage full, {} blocks from block {} need {:#x} bytes, capacity {:#x}",
                blocks,
                first,
                end,
                self.storage.capacity()
            )));
        }
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<()> {
        let block = self.next_block.ok_or_else(|| {
            Error::Protocol("block numbers exhausted for this session".into())
        })?;

        let address = (block as u64 + 1) * self.block_size as u64;
        if address + self.block_size as u64 > self.storage.capacity() {
            return Err(Error::Protocol(format!(
                "storage full, block {} at {:#x} does not fit",
                block, address
            )));
        }

        let header = BlockHeader::new(self.session_id, block, payload.len() as u16);
        self.buf.clear();
        self.buf.put_slice(&header.encode(&self.crc));
        self.buf.put_slice(payload);
        self.buf.resize(self.block_size, ERASED);

        self.storage.write_at(address, &self.buf)?;
        tracing::trace!(
            "Write block {} of session {}, payload: {}",
            block,
            self.session_id,
            payload.len()
        );

        self.next_block = block.checked_add(1);
        Ok(())
    }
}
