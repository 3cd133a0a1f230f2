//! In-process transport pair
//!
//! [`MemoryTransport`] is handed to the engine, [`PumpEndpoint`] plays the
//! pump side. Dropping either end looks like a lost link to the other.

use tokio::sync::mpsc;

use super::Transport;
use crate::error::TransportError;

/// Engine side of an in-memory link.
#[derive(Debug)]
pub struct MemoryTransport {
    to_pump: mpsc::UnboundedSender<Vec<u8>>,
    from_pump: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Pump side of an in-memory link.
#[derive(Debug)]
pub struct PumpEndpoint {
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, PumpEndpoint) {
        let (to_pump, from_host) = mpsc::unbounded_channel();
        let (to_host, from_pump) = mpsc::unbounded_channel();
        (MemoryTransport { to_pump, from_pump }, PumpEndpoint { to_host, from_host })
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.to_pump.send(bytes.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_pump.recv().await
    }
}

impl PumpEndpoint {
    /// Next chunk written by the engine, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_host.recv().await
    }

    /// Deliver bytes to the engine.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.to_host.send(bytes.into()).map_err(|_| TransportError::Closed)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_host.try_recv().ok()
    }
}
