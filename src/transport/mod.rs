//! Transport abstraction
//!
//! The platform's BLE or serial layer implements [`Transport`]; the engine
//! only needs to write records and pull inbound chunks. Chunk boundaries
//! carry no meaning, the codec's reader re-frames the byte stream.

pub mod memory;
pub mod virtual_pump;

use crate::error::TransportError;

/// Bidirectional byte link to one pump.
///
/// Implementations handle their own connection management. A dropped link is
/// reported by `recv` returning `None`; the engine then fails all pending
/// work with [`PumpError::Disconnected`](crate::PumpError::Disconnected) and
/// expires the session.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Write one encoded record.
    ///
    /// A failed write is treated as a disconnect.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next inbound chunk.
    ///
    /// Returns:
    /// - `Some(bytes)` - Bytes arrived, possibly a partial or several records
    /// - `None` - The link is gone
    ///
    /// Must be cancel-safe: the engine polls it inside `select!` alongside
    /// timers and caller requests.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

