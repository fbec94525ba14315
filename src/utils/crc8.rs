use crc::{Crc, Digest, CRC_8_DVB_S2};

/// CRC-8 used on the link and on flash: CRC-8/DVB-S2, polynomial 0xD5,
/// MSB first, zero init, no final xor.
///
/// Built once and then passed by reference to everything that checks a
/// header or a packet.
pub struct Crc8 {
    crc: Crc<u8>,
}

impl Crc8 {
    pub const fn new() -> Self {
        Self {
            crc: Crc::<u8>::new(&CRC_8_DVB_S2),
        }
    }

    pub fn compute(&self, bytes: &[u8]) -> u8 {
        self.crc.checksum(bytes)
    }

    /// Running checksum over data that arrives in pieces.
    pub fn digest(&self) -> Digest<'_, u8> {
        self.crc.digest()
    }

    /// `bytes` ends with its own check value.
    pub fn verify(&self, bytes: &[u8]) -> bool {
        match bytes.split_last() {
            Some((crc, body)) => self.compute(body) == *crc,
            None => false,
        }
    }
}

impl Default for Crc8 {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Crc8 {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc8 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc8")
            .field("poly", &self.crc.algorithm.poly)
            .finish()
    }
}
