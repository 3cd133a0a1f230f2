//! Opcode newtype shared by commands and frames

use serde::{Deserialize, Serialize};

/// Command/response opcode.
///
/// Families with one-byte opcodes only use the low byte; the codec enforces
/// the width declared by the family descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Raw opcode value.
    pub fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for Opcode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
