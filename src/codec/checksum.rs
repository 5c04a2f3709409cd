//! Frame check algorithms.

use crc::{CRC_16_MODBUS, Crc};

use crate::error::{Error, Result};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// The check value appended to every frame of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// CRC-16/MODBUS (poly 0x8005 reflected, init 0xFFFF), sent low byte first.
    Crc16Modbus,
    /// Wrapping 8-bit sum of every byte.
    Sum8,
}

impl Checksum {
    /// Number of check bytes on the wire.
    pub const fn len(self) -> usize {
        match self {
            Checksum::Crc16Modbus => 2,
            Checksum::Sum8 => 1,
        }
    }

    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Checksum::Crc16Modbus => MODBUS_CRC.checksum(data),
            Checksum::Sum8 => data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) as u16,
        }
    }

    /// Read the check value stored at the start of `bytes`.
    pub fn read(self, bytes: &[u8]) -> u16 {
        match self {
            Checksum::Crc16Modbus => u16::from_le_bytes([bytes[0], bytes[1]]),
            Checksum::Sum8 => bytes[0] as u16,
        }
    }

    /// Append the check value of `frame` to `frame`.
    pub fn append<const N: usize>(self, frame: &mut heapless::Vec<u8, N>) -> Result<()> {
        let value = self.compute(frame);
        match self {
            Checksum::Crc16Modbus => frame
                .extend_from_slice(&value.to_le_bytes())
                .map_err(|_| Error::BufferError),
            Checksum::Sum8 => frame.push(value as u8).map_err(|_| Error::BufferError),
        }
    }
}
