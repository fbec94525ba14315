use bytes::Bytes;

use crate::error::{Error, Result};

/// Walks a header or payload region in chunks of at most `chunk_size`.
///
/// The current chunk stays put until `advance`, so a resend after a NACK
/// always carries the same bytes.
#[derive(Debug, Clone)]
pub struct Chunker {
    region: Bytes,
    chunk_size: usize,
    offset: usize,
}

impl Chunker {
    pub fn new(region: Bytes, chunk_size: usize) -> Self {
        assert_ne!(chunk_size, 0, "chunk size must be greater than 0");
        Self {
            region,
            chunk_size,
            offset: 0,
        }
    }

    /// Offset of the current chunk within the region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.region.len()
    }

    pub fn current(&self) -> Bytes {
        let end = (self.offset + self.chunk_size).min(self.region.len());
        self.region.slice(self.offset.min(end)..end)
    }

    /// Move past the current chunk once it is acknowledged and return its
    /// length.
    pub fn advance(&mut self) -> usize {
        let n = self.current().len();
        self.offset += n;
        n
    }
}

/// Counts chunk bytes of one region against its declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reassembly {
    expected: usize,
    received: usize,
}

impl Reassembly {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn remaining(&self) -> usize {
        self.expected - self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// Check that a chunk of `len` bytes fits before anything is stored.
    pub fn check(&self, len: usize) -> Result<()> {
        if len > self.remaining() {
            return Err(Error::Protocol(format!(
                "chunk of {} bytes overruns region, {} of {} received",
                len, self.received, self.expected
            )));
        }
        Ok(())
    }

    pub fn accept(&mut self, len: usize) -> Result<()> {
        self.check(len)?;
        self.received += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use itertools::Itertools;

    use super::*;

    fn collect(mut chunker: Chunker) -> Vec<Bytes> {
        let mut out = Vec::new();
        while !chunker.is_done() {
            out.push(chunker.current());
            chunker.advance();
        }
        out
    }

    #[test]
    fn split_exact_multiple() {
        let region = Bytes::from((0..128u8).collect_vec());
        let chunks = collect(Chunker::new(region.clone(), 64));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], region.slice(0..64));
        assert_eq!(chunks[1], region.slice(64..));
    }

    #[test]
    fn split_with_tail() {
        let region = Bytes::from((0..150u8).collect_vec());
        let chunks = collect(Chunker::new(region.clone(), 64));
        assert_eq!(chunks.iter().map(|c| c.len()).collect_vec(), vec![64, 64, 22]);
        assert_eq!(chunks.concat(), region.to_vec());
    }

    #[test]
    fn empty_region_has_no_chunks() {
        let chunker = Chunker::new(Bytes::new(), 64);
        assert!(chunker.is_done());
        assert!(chunker.is_empty());
        assert!(collect(chunker).is_empty());
    }

    #[test]
    fn current_is_stable_until_advance() {
        let mut chunker = Chunker::new(Bytes::from_static(b"header"), 4);
        assert_eq!(chunker.current(), Bytes::from_static(b"head"));
        assert_eq!(chunker.current(), Bytes::from_static(b"head"));
        assert_eq!(chunker.advance(), 4);
        assert_eq!(chunker.offset(), 4);
        assert_eq!(chunker.current(), Bytes::from_static(b"er"));
        assert_eq!(chunker.advance(), 2);
        assert!(chunker.is_done());
        assert_eq!(chunker.advance(), 0);
    }

    #[test]
    fn reassembly_tracks_progress() -> anyhow::Result<()> {
        let mut progress = Reassembly::new(150);
        progress.accept(64)?;
        progress.accept(64)?;
        assert_eq!(progress.remaining(), 22);
        assert!(!progress.is_complete());
        assert!(progress.check(23).is_err());
        progress.accept(22)?;
        assert!(progress.is_complete());
        assert!(progress.accept(1).is_err());
        assert_eq!(progress.received(), 150);
        Ok(())
    }

    #[test]
    fn zero_length_region_is_complete() {
        let progress = Reassembly::new(0);
        assert!(progress.is_complete());
        assert_eq!(progress.expected(), 0);
    }
}
