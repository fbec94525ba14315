use std::time::Duration;

use crate::{
    error::{Error, Result},
    log::HEADER_SIZE,
    protocol::packet::{MAX_CHUNK_SIZE, PACKET_OVERHEAD},
};

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_SIZE: usize = 64;
pub const DEFAULT_RETRY_LIMIT: u32 = 8;
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Knobs shared by both ends of a transfer. Both sides must agree on the
/// layout values (`block_size`, `max_payload`, `chunk_size`).
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) block_size: usize,
    pub(crate) max_payload: usize,
    pub(crate) chunk_size: usize,
    pub(crate) retry_limit: u32,
    pub(crate) ack_timeout: Duration,
    pub(crate) byte_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) announce_timeout: Option<Duration>,
    pub(crate) end_marker: bool,
    pub(crate) baud_rate: u32,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    /// Physical size of one block slot in storage.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn byte_timeout(&self) -> Duration {
        self.byte_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn announce_timeout(&self) -> Option<Duration> {
        self.announce_timeout
    }

    pub fn end_marker(&self) -> bool {
        self.end_marker
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Address of block `n`. The session id slot owns the first block.
    pub fn block_address(&self, block: u16) -> u64 {
        (block as u64 + 1) * self.block_size as u64
    }

    /// Time to clock `bytes` out at 8N1.
    pub fn air_time(&self, bytes: usize) -> Duration {
        Duration::from_micros(bytes as u64 * 10 * 1_000_000 / self.baud_rate as u64)
    }

    /// Longest silence a live sender can leave inside a block: every attempt
    /// of one unit lost, plus the idle window.
    pub fn sender_window(&self) -> Duration {
        self.ack_timeout
            .saturating_mul(self.retry_limit.saturating_add(1))
            .saturating_add(self.idle_timeout)
    }

    /// Packets needed to carry a region of `len` bytes.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_payload: DEFAULT_BLOCK_SIZE - HEADER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_limit: DEFAULT_RETRY_LIMIT,
            ack_timeout: Duration::from_millis(500),
            byte_timeout: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(2),
            announce_timeout: None,
            end_marker: true,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
    max_payload_set: bool,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical block size. Unless `max_payload` is set explicitly, the
    /// payload bound follows it.
    pub fn block_size(&mut self, block_size: usize) -> &mut Self {
        self.options.block_size = block_size;
        self
    }

    pub fn max_payload(&mut self, max_payload: usize) -> &mut Self {
        self.options.max_payload = max_payload;
        self.max_payload_set = true;
        self
    }

    /// Largest data section of one packet, at most 255 bytes.
    pub fn chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.options.chunk_size = chunk_size;
        self
    }

    /// Resends allowed after the first attempt of a unit.
    pub fn retry_limit(&mut self, retry_limit: u32) -> &mut Self {
        self.options.retry_limit = retry_limit;
        self
    }

    pub fn ack_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.ack_timeout = timeout;
        self
    }

    /// Longest gap tolerated between two bytes of the same unit.
    pub fn byte_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.byte_timeout = timeout;
        self
    }

    /// Silence at a block boundary after which the receiver ends the transfer.
    pub fn idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.idle_timeout = timeout;
        self
    }

    /// `None` waits forever for the announcement.
    pub fn announce_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.announce_timeout = timeout;
        self
    }

    pub fn end_marker(&mut self, enabled: bool) -> &mut Self {
        self.options.end_marker = enabled;
        self
    }

    pub fn baud_rate(&mut self, baud_rate: u32) -> &mut Self {
        self.options.baud_rate = baud_rate;
        self
    }

    pub fn build(&self) -> Result<Options> {
        let mut options = self.options.clone();
        if options.block_size <= HEADER_SIZE {
            return Err(Error::InvalidOptions(format!(
                "block size {} leaves no room after the {} byte header",
                options.block_size, HEADER_SIZE
            )));
        }

        let payload_bound = (options.block_size - HEADER_SIZE).min(u16::MAX as usize);
        if !self.max_payload_set {
            options.max_payload = payload_bound;
        }
        if options.max_payload == 0 || options.max_payload > payload_bound {
            return Err(Error::InvalidOptions(format!(
                "max payload {} outside 1..={}",
                options.max_payload, payload_bound
            )));
        }

        if options.chunk_size == 0 || options.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidOptions(format!(
                "chunk size {} outside 1..={}",
                options.chunk_size, MAX_CHUNK_SIZE
            )));
        }

        if options.baud_rate == 0 {
            return Err(Error::InvalidOptions("baud rate must be non-zero".into()));
        }

        if options.byte_timeout.is_zero() {
            return Err(Error::InvalidOptions("byte timeout must be non-zero".into()));
        }

        // A damaged unit may stall for one byte timeout before the receiver
        // starts draining, and the drain waits out another before the NACK.
        let round_trip = options.air_time(options.chunk_size + PACKET_OVERHEAD) * 2;
        let nack_deadline = round_trip + options.byte_timeout * 2;
        if options.ack_timeout <= nack_deadline {
            return Err(Error::InvalidOptions(format!(
                "ack timeout {:?} must exceed {:?} (packet round trip plus two byte timeouts)",
                options.ack_timeout, nack_deadline
            )));
        }

        if options.idle_timeout <= options.ack_timeout {
            return Err(Error::InvalidOptions(format!(
                "idle timeout {:?} must exceed ack timeout {:?}",
                options.idle_timeout, options.ack_timeout
            )));
        }

        tracing::debug!(
            "Options built, block size: {}, max payload: {}, chunk size: {}, retry limit: {}",
            options.block_size,
            options.max_payload,
            options.chunk_size,
            options.retry_limit
        );
        Ok(options)
    }
}
