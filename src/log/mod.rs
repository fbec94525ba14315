/// Flash log layout:
///
/// ```text
///     +----------------------+  address 0
///     | session id: 1b | ... |
///     +----------------------+  block_size
///     |       Block 0        |
///     +----------------------+  2 * block_size
///     |       Block 1        |
///     +----------------------+
///     |         ...          |
///     +----------------------+
///     |       Block n        |
///     +----------------------+
/// ```
///
/// Block format:
///
/// ```text
///     +--------------------------------------------+
///     | header 6b | payload | padding (0xFF)       |
///     +--------------------------------------------+
/// ```
///
/// Header format:
///
/// ```text
///     +----------------------------------------------------------------+
///     | session id 1b | block number 2b | payload len 2b | crc8 1b     |
///     +----------------------------------------------------------------+
/// ```
///
/// Integers are little endian. The crc covers the five bytes before it.
/// A new session keeps the blocks of older sessions in place, so the log of
/// the current session ends at the first block whose header fails its crc,
/// carries another session id, or breaks the block numbering.
pub mod reader;
pub mod writer;

use bytes::{Buf, BufMut};

use crate::utils::crc8::Crc8;

pub const HEADER_SIZE: usize = 6;
pub const SESSION_ID_ADDRESS: u64 = 0;

/// Value of erased flash.
pub const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub session_id: u8,
    pub block_number: u16,
    pub payload_length: u16,
}

impl BlockHeader {
    pub fn new(session_id: u8, block_number: u16, payload_length: u16) -> Self {
        Self {
            session_id,
            block_number,
            payload_length,
        }
    }

    pub fn encode(&self, crc: &Crc8) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.session_id);
        buf.put_u16_le(self.block_number);
        buf.put_u16_le(self.payload_length);
        out[HEADER_SIZE - 1] = crc.compute(&out[..HEADER_SIZE - 1]);
        out
    }

    /// `None` when the check byte does not match, which is what erased or
    /// torn flash looks like.
    pub fn decode(bytes: &[u8], crc: &Crc8) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || !crc.verify(&bytes[..HEADER_SIZE]) {
            return None;
        }

        let mut buf = bytes;
        let session_id = buf.get_u8();
        let block_number = buf.get_u16_le();
        let payload_length = buf.get_u16_le();
        Some(Self {
            session_id,
            block_number,
            payload_length,
        })
    }

    /// True when this header continues the log of `session_id` at `expected`.
    pub fn continues(&self, session_id: u8, expected: u16) -> bool {
        self.session_id == session_id && self.block_number == expected
    }
}
