pub mod crc8;
