//! Serial-over-TCP bridges (ser2net and friends) expose the UART as a plain
//! byte stream.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use crate::error::Result;

use super::SerialLink;

// A zero read timeout is rejected by the socket API.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

impl SerialLink for TcpStream {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        self.flush()?;
        Ok(())
    }

    fn recv_byte(&mut self, timeout: Option<Duration>) -> Result<Option<u8>> {
        self.set_read_timeout(timeout.map(|t| t.max(MIN_TIMEOUT)))?;

        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        time::Duration,
    };

    use super::*;

    fn pair() -> anyhow::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        Ok((client, server))
    }

    #[test]
    fn bytes_cross_the_socket() -> anyhow::Result<()> {
        let (mut a, mut b) = pair()?;
        a.send(&[1, 2, 3])?;

        let timeout = Some(Duration::from_millis(500));
        assert_eq!(b.recv_byte(timeout)?, Some(1));
        assert_eq!(b.recv_byte(timeout)?, Some(2));
        assert_eq!(b.recv_byte(timeout)?, Some(3));
        assert_eq!(b.recv_byte(Some(Duration::from_millis(20)))?, None);
        Ok(())
    }

    #[test]
    fn closed_socket_reads_as_silence() -> anyhow::Result<()> {
        let (a, mut b) = pair()?;
        drop(a);
        assert_eq!(b.recv_byte(Some(Duration::from_millis(500)))?, None);
        Ok(())
    }
}
