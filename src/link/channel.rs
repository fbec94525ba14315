use std::{collections::VecDeque, io, time::Duration};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{Error, Result};

use super::SerialLink;

/// One end of an in-memory duplex link.
///
/// Each `send` travels as one message, the receiving end hands it out byte by
/// byte. Dropping one end closes the stream for the other.
pub struct ChannelLink {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    pending: VecDeque<u8>,
}

impl ChannelLink {
    pub fn pair() -> (ChannelLink, ChannelLink) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        let a = ChannelLink {
            tx: a_tx,
            rx: a_rx,
            pending: VecDeque::new(),
        };
        let b = ChannelLink {
            tx: b_tx,
            rx: b_rx,
            pending: VecDeque::new(),
        };
        (a, b)
    }

    fn refill(&mut self, timeout: Option<Duration>) -> bool {
        let msg = match timeout {
            None => self.rx.recv().ok(),
            Some(t) if t.is_zero() => match self.rx.try_recv() {
                Ok(msg) => Some(msg),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            },
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        };

        match msg {
            Some(msg) => {
                self.pending.extend(msg.iter());
                true
            }
            None => false,
        }
    }
}

impl SerialLink for ChannelLink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx.send(Bytes::copy_from_slice(bytes)).map_err(|_| {
            Error::IO(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link peer hung up",
            ))
        })
    }

    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>> {
        // Empty messages carry nothing, keep waiting past them.
        while self.pending.is_empty() {
            if !self.refill(timeout) {
                return Ok(None);
            }
        }
        Ok(self.pending.pop_front())
    }
}
