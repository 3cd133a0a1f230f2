//! Trailing integrity fields

use serde::{Deserialize, Serialize};

/// Integrity check appended to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityKind {
    /// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), big-endian on the wire.
    Crc16CcittFalse,
    /// Wrapping 16-bit sum of all bytes, big-endian on the wire.
    Sum16,
    /// XOR of all bytes.
    Xor8,
}

impl IntegrityKind {
    /// Width of the field on the wire.
    pub const fn len(self) -> usize {
        match self {
            IntegrityKind::Crc16CcittFalse | IntegrityKind::Sum16 => 2,
            IntegrityKind::Xor8 => 1,
        }
    }

    pub fn compute(self, bytes: &[u8]) -> u32 {
        match self {
            IntegrityKind::Crc16CcittFalse => u32::from(crc16_ccitt_false(bytes)),
            IntegrityKind::Sum16 => {
                u32::from(bytes.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b))))
            }
            IntegrityKind::Xor8 => u32::from(bytes.iter().fold(0u8, |acc, &b| acc ^ b)),
        }
    }

    /// Append the integrity of `out[covered_start..]` to `out`.
    pub fn append(self, covered_start: usize, out: &mut Vec<u8>) {
        let value = self.compute(&out[covered_start..]);
        match self.len() {
            2 => out.extend_from_slice(&(value as u16).to_be_bytes()),
            _ => out.push(value as u8),
        }
    }

    /// Read the field from exactly `self.len()` bytes.
    pub fn read(self, field: &[u8]) -> u32 {
        match field {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [b] => u32::from(*b),
            _ => 0,
        }
    }
}

pub fn crc16_ccitt_false(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
