//! Link packet format:
//!
//! ```text
//!     +------------------------------------------------------+
//!     | seq 2b | len 1b | data: len bytes | crc8 1b          |
//!     +------------------------------------------------------+
//! ```
//!
//! `seq` is little endian. The crc covers seq, len and data. `len` makes
//! every unit self-framing, so the receiver can tell a resent unit from a
//! fresh one whatever state it is in.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{Error, Result},
    link::SerialLink,
    utils::crc8::Crc8,
};

use super::{ANNOUNCE_SEQ, END_SEQ};

pub const PACKET_OVERHEAD: usize = 4;
pub const MAX_CHUNK_SIZE: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u16,
    pub data: Bytes,
}

impl Packet {
    pub fn new(seq: u16, data: Bytes) -> Self {
        debug_assert!(data.len() <= MAX_CHUNK_SIZE);
        Self { seq, data }
    }

    pub fn announce(session_id: u8) -> Self {
        Self::new(ANNOUNCE_SEQ, Bytes::copy_from_slice(&[session_id]))
    }

    pub fn end(session_id: u8) -> Self {
        Self::new(END_SEQ, Bytes::copy_from_slice(&[session_id]))
    }

    pub fn is_announce(&self) -> bool {
        self.seq == ANNOUNCE_SEQ
    }

    pub fn is_end(&self) -> bool {
        self.seq == END_SEQ
    }

    /// Session id carried by an announcement or end marker.
    pub fn session_id(&self) -> Option<u8> {
        match (self.is_announce() || self.is_end(), self.data.len()) {
            (true, 1) => Some(self.data[0]),
            _ => None,
        }
    }

    pub fn encode(&self, crc: &Crc8) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_OVERHEAD + self.data.len());
        buf.put_u16_le(self.seq);
        buf.put_u8(self.data.len() as u8);
        buf.put(self.data.as_ref());
        let check = crc.compute(buf.as_ref());
        buf.put_u8(check);
        buf.freeze()
    }

    pub fn decode(raw: Bytes, crc: &Crc8) -> Result<Self> {
        if raw.len() < PACKET_OVERHEAD {
            return Err(Error::LinkCorruption(format!(
                "unit of {} bytes is shorter than a packet",
                raw.len()
            )));
        }

        let mut ptr = &raw[..];
        let seq = ptr.get_u16_le();
        let len = ptr.get_u8() as usize;
        if raw.len() != PACKET_OVERHEAD + len {
            return Err(Error::LinkCorruption(format!(
                "unit of {} bytes declares {} data bytes",
                raw.len(),
                len
            )));
        }

        if !crc.verify(&raw) {
            return Err(Error::LinkCorruption(format!(
                "crc mismatch on seq {:#06x}",
                seq
            )));
        }

        let data = raw.slice(3..3 + len);
        Ok(Self { seq, data })
    }
}

/// Read one packet off the link.
///
/// `LinkTimeout` means nothing arrived within `first_timeout`.
/// `LinkCorruption` covers a unit that stalled for longer than
/// `byte_timeout`, declared more than `max_data` bytes, or failed its crc.
pub fn read_packet<L: SerialLink + ?Sized>(
    link: &mut L,
    crc: &Crc8,
    max_data: usize,
    first_timeout: Option<Duration>,
    byte_timeout: Duration,
) -> Result<Packet> {
    let first = link.recv_byte(first_timeout)?.ok_or_else(|| {
        Error::LinkTimeout(match first_timeout {
            Some(t) => format!("no unit within {:?}", t),
            None => "link closed".to_string(),
        })
    })?;

    let mut raw = BytesMut::with_capacity(PACKET_OVERHEAD + max_data);
    raw.put_u8(first);
    read_more(link, &mut raw, 2, byte_timeout)?;

    let len = raw[2] as usize;
    if len > max_data {
        return Err(Error::LinkCorruption(format!(
            "declared length {} above chunk size {}",
            len, max_data
        )));
    }

    read_more(link, &mut raw, len + 1, byte_timeout)?;
    Packet::decode(raw.freeze(), crc)
}

fn read_more<L: SerialLink + ?Sized>(
    link: &mut L,
    raw: &mut BytesMut,
    count: usize,
    byte_timeout: Duration,
) -> Result<()> {
    for _ in 0..count {
        match link.recv_byte(Some(byte_timeout))? {
            Some(b) => raw.put_u8(b),
            None => {
                return Err(Error::LinkCorruption(format!(
                    "unit stalled after {} bytes",
                    raw.len()
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use crate::link::{channel::ChannelLink, SerialLink};

    use super::*;

    const BYTE_TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn packet_encode() {
        let crc = Crc8::default();
        let data = Bytes::copy_from_slice(b"chunk-data");
        let packet = Packet::new(0x0102, data.clone());

        let encode = packet.encode(&crc);
        assert_eq!(encode.len(), PACKET_OVERHEAD + data.len());

        let mut buf = &encode[..];
        assert_eq!(buf.get_u16_le(), 0x0102);
        assert_eq!(buf.get_u8() as usize, data.len());
        assert_eq!(&buf[..data.len()], data.as_ref());

        let mut buf = &buf[data.len()..];
        let check = buf.get_u8();

        let mut expect = BytesMut::new();
        expect.put_u16_le(0x0102);
        expect.put_u8(data.len() as u8);
        expect.put(data.as_ref());
        assert_eq!(check, crc.compute(&expect));
    }

    #[test]
    fn announcement_layout() -> anyhow::Result<()> {
        let crc = Crc8::default();
        let encode = Packet::announce(0x2A).encode(&crc);
        assert_eq!(&encode[..4], &[0xFF, 0xFF, 0x01, 0x2A]);
        assert_eq!(encode[4], crc.compute(&encode[..4]));

        let packet = Packet::decode(encode, &crc)?;
        assert!(packet.is_announce());
        assert_eq!(packet.session_id(), Some(0x2A));

        let end = Packet::end(0x2A);
        assert!(end.is_end());
        assert_eq!(end.session_id(), Some(0x2A));
        assert_eq!(Packet::new(3, Bytes::from_static(b"x")).session_id(), None);
        Ok(())
    }

    #[test]
    fn decode_rejects_damage() {
        let crc = Crc8::default();
        let encode = Packet::new(7, Bytes::from_static(b"payload")).encode(&crc);

        let mut flipped = encode.to_vec();
        flipped[5] ^= 0x10;
        assert!(matches!(
            Packet::decode(Bytes::from(flipped), &crc),
            Err(Error::LinkCorruption(_))
        ));

        assert!(matches!(
            Packet::decode(encode.slice(..encode.len() - 1), &crc),
            Err(Error::LinkCorruption(_))
        ));
        assert!(matches!(
            Packet::decode(Bytes::from_static(b"\x00"), &crc),
            Err(Error::LinkCorruption(_))
        ));
    }

    #[test]
    fn empty_data_packet() -> anyhow::Result<()> {
        let crc = Crc8::default();
        let encode = Packet::new(9, Bytes::new()).encode(&crc);
        assert_eq!(encode.len(), PACKET_OVERHEAD);
        let packet = Packet::decode(encode, &crc)?;
        assert_eq!(packet.seq, 9);
        assert!(packet.data.is_empty());
        Ok(())
    }

    #[test]
    fn read_from_link() -> anyhow::Result<()> {
        let crc = Crc8::default();
        let (mut a, mut b) = ChannelLink::pair();
        let packet = Packet::new(1, Bytes::from_static(b"abc"));
        a.send(&packet.encode(&crc))?;

        let read = read_packet(&mut b, &crc, 64, Some(BYTE_TIMEOUT), BYTE_TIMEOUT)?;
        assert_eq!(read, packet);
        Ok(())
    }

    #[test]
    fn read_times_out_on_silence() {
        let crc = Crc8::default();
        let (_a, mut b) = ChannelLink::pair();
        let res = read_packet(&mut b, &crc, 64, Some(BYTE_TIMEOUT), BYTE_TIMEOUT);
        assert!(matches!(res, Err(Error::LinkTimeout(_))));
    }

    #[test]
    fn read_truncated_unit_is_corruption() -> anyhow::Result<()> {
        let crc = Crc8::default();
        let (mut a, mut b) = ChannelLink::pair();
        let encode = Packet::new(1, Bytes::from_static(b"abcdef")).encode(&crc);
        a.send(&encode[..5])?;

        let res = read_packet(&mut b, &crc, 64, Some(BYTE_TIMEOUT), BYTE_TIMEOUT);
        assert!(matches!(res, Err(Error::LinkCorruption(_))));
        Ok(())
    }

    #[test]
    fn read_rejects_oversized_length() -> anyhow::Result<()> {
        let crc = Crc8::default();
        let (mut a, mut b) = ChannelLink::pair();
        a.send(&Packet::new(1, Bytes::from(vec![0u8; 20])).encode(&crc))?;

        let res = read_packet(&mut b, &crc, 16, Some(BYTE_TIMEOUT), BYTE_TIMEOUT);
        assert!(matches!(res, Err(Error::LinkCorruption(_))));
        Ok(())
    }
}
