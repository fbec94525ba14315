//! The half-duplex byte link between controller and capture device.
//!
//! Both state machines only need three primitives: push bytes, wait for one
//! byte with a deadline, and throw away whatever is still arriving.

pub mod channel;
pub mod faulty;
pub mod tcp;

use std::time::Duration;

use crate::error::Result;

pub trait SerialLink {
    /// Queue `bytes` for transmission.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next byte, forever when `timeout` is
    /// `None`. `Ok(None)` means the deadline passed or the peer closed the
    /// stream; the protocol treats both as silence.
    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>>;

    /// Discard input until the line has been quiet for `quiet`.
    fn drain(&mut self, quiet: Duration) -> Result<usize> {
        let mut dropped = 0;
        while self.recv_byte(Some(quiet))?.is_some() {
            dropped += 1;
        }
        Ok(dropped)
    }
}

impl<L: SerialLink + ?Sized> SerialLink for &mut L {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>> {
        (**self).recv_byte(timeout)
    }

    fn drain(&mut self, quiet: Duration) -> Result<usize> {
        (**self).drain(quiet)
    }
}

impl<L: SerialLink + ?Sized> SerialLink for Box<L> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).send(bytes)
    }

    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>> {
        (**self).recv_byte(timeout)
    }

    fn drain(&mut self, quiet: Duration) -> Result<usize> {
        (**self).drain(quiet)
    }
}
