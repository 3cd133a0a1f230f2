//! Command/response protocol engine for insulin pumps.
//!
//! pumplink reliably exchanges short binary commands and multi-frame
//! responses with a pump over a lossy, half-duplex, single-connection link.
//! One generic engine serves every pump family; a [`FamilyDescriptor`]
//! supplies the byte-level dialect as data.
//!
//! # Features
//!
//! - **Framing**: sync prefix, one- or two-byte opcodes, CRC-16, sum or XOR
//!   integrity, stream re-synchronisation
//! - **Sessions**: nonce handshake, ChaCha20-Poly1305 records, sequence
//!   exhaustion and re-key handling
//! - **Dispatch**: strict FIFO with one command in flight, per-command
//!   timeout and retry budget, duplicate hints for side-effecting commands
//! - **Status**: atomic snapshots decoded from every valid frame, published on
//!   a watch channel
//!
//! # Architecture
//!
//! ```text
//! caller ──submit──▶ PumpConnection ──Request──▶ dispatcher task
//!                                                  │  codec + session
//!                                                  ▼
//!                                               Transport (BLE / serial)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use pumplink::family::presets;
//! use pumplink::{Command, PumpConnection, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn run(transport: impl pumplink::transport::Transport) -> pumplink::Result<()> {
//! let connection = PumpConnection::open(presets::dana_rs(), transport, b"pairing-key".to_vec())?;
//!
//! let bolus = Command::new(0x21, vec![0x00, 0x32])
//!     .with_policy(RetryPolicy::new(Duration::from_millis(800), 2))
//!     .side_effecting();
//! let response = connection.submit(bolus).await?;
//! if response.possibly_duplicated {
//!     // reconcile against the pump's history before trusting the count
//! }
//! println!("reservoir: {:?}", connection.current_status().reservoir_units);
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod codec;
pub mod config;
pub mod connection;
mod dispatcher;
mod error;
pub mod family;
pub mod history;
pub mod refresh;
pub mod session;
pub mod status;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transport;
pub mod types;

pub use config::EngineConfig;
pub use connection::{CommandSender, PendingResponse, PumpConnection, PumpConnectionBuilder};
pub use dispatcher::LinkStats;
pub use error::*;
pub use family::FamilyDescriptor;
pub use history::HistorySink;
pub use refresh::{RefreshKind, RefreshSchedule, Refresher};
pub use types::*;
