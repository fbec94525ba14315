//! Block transfer protocol between the controller (sender) and the capture
//! device (receiver).
//!
//! One unit is in flight at a time. The sender pushes a packet and waits for
//! a single reply byte; the receiver checks the packet and answers `ACK` or
//! `NACK`. A transfer is:
//!
//! ```text
//!     sender                                receiver
//!       | -- announce (seq 0xFFFF, id) ------> |
//!       | <------------------------------ ACK |
//!       | -- header chunk(s) of block 0 -----> |
//!       | <------------------------------ ACK |
//!       | -- payload chunk 0 ----------------> |
//!       | <----------------------------- NACK |  crc failed
//!       | -- payload chunk 0 (resent) -------> |
//!       | <------------------------------ ACK |
//!       |               ...                    |
//!       | -- end marker (seq 0xFFFE, id) ----> |  or silence
//!       | <------------------------------ ACK |
//! ```
//!
//! Neither side knows the log length up front. The sender stops at the first
//! block that does not continue the session; the receiver stops on the end
//! marker, or when the line stays idle at a block boundary.

pub mod framer;
pub mod packet;
pub mod receiver;
pub mod sender;

use std::fmt;

pub const ACK: u8 = 0x06;
pub const NACK: u8 = 0x15;

/// Sequence number reserved for the session announcement.
pub const ANNOUNCE_SEQ: u16 = 0xFFFF;
/// Sequence number reserved for the end-of-transfer marker.
pub const END_SEQ: u16 = 0xFFFE;

/// Sequence number of the packet after `seq`. Block traffic never uses the
/// reserved numbers.
pub fn next_seq(seq: u16) -> u16 {
    let next = seq.wrapping_add(1);
    if next >= END_SEQ {
        0
    } else {
        next
    }
}

/// The unit a retry or failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Announcement,
    Header { block: u16, offset: usize },
    Payload { block: u16, offset: usize },
    EndMarker,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Announcement => write!(f, "session announcement"),
            Unit::Header { block, offset } => {
                write!(f, "header chunk of block {} at offset {}", block, offset)
            }
            Unit::Payload { block, offset } => {
                write!(f, "payload chunk of block {} at offset {}", block, offset)
            }
            Unit::EndMarker => write!(f, "end marker"),
        }
    }
}

/// Why a side decided the log was over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// No intact header under the cursor (erased or torn flash).
    NoHeader,
    /// The next header belongs to an older session.
    SessionMismatch { found: u8 },
    /// The next header breaks the block numbering.
    BlockGap { expected: u16, found: u16 },
    /// The next block would run past the end of storage.
    StorageExhausted,
    /// Block 0xFFFF was the last one a session can number.
    BlockNumbersExhausted,
    /// The sender announced the end explicitly.
    EndMarker,
    /// Nothing arrived within the idle window at a block boundary.
    IdleTimeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::NoHeader => write!(f, "no intact header"),
            EndReason::SessionMismatch { found } => {
                write!(f, "header of session {}", found)
            }
            EndReason::BlockGap { expected, found } => {
                write!(f, "expected block {}, found {}", expected, found)
            }
            EndReason::StorageExhausted => write!(f, "end of storage"),
            EndReason::BlockNumbersExhausted => write!(f, "block numbers exhausted"),
            EndReason::EndMarker => write!(f, "end marker"),
            EndReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Per-side progress through the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCursor {
    pub expected_block: u16,
    pub bytes_in_block: usize,
    pub retries_for_unit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub session_id: u8,
    /// Blocks fully acknowledged.
    pub blocks: u32,
    /// Payload bytes fully acknowledged.
    pub bytes: u64,
    /// Resends (sender) or NACKs sent (receiver).
    pub retries: u32,
    pub end: EndReason,
}
