//! Error types for the pump command engine.
//!
//! Two layers of errors exist:
//!
//! - [`PumpError`] is what callers of [`PumpConnection::submit`](crate::PumpConnection::submit)
//!   see. Only terminal outcomes reach this layer: exhausted retries, lost
//!   transports, semantic rejections by the pump and broken multi-frame streams.
//! - [`DecodeError`] describes protocol noise (bad checksums, stale or
//!   uncorrelated frames). It is logged and counted by the dispatcher and never
//!   surfaced to a caller.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use pumplink::PumpError;
//!
//! let error = PumpError::SessionNotReady { state: pumplink::SessionState::Handshaking };
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::types::{Opcode, SessionState};

/// Result type alias for engine operations.
pub type Result<T, E = PumpError> = std::result::Result<T, E>;

/// Terminal outcome of a command, or a failure of the engine surface itself.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PumpError {
    #[error("Session is not ready for commands (state: {state})")]
    SessionNotReady { state: SessionState },

    #[error("Command {opcode} exhausted {attempts} attempt(s) without a response")]
    Exhausted {
        opcode: Opcode,
        attempts: u32,
        /// At least one transmission reached the wire, so the pump may have acted on it.
        may_have_been_delivered: bool,
    },

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Pump rejected command {opcode} with code {code:#04x}")]
    Rejected { opcode: Opcode, code: u8 },

    #[error("Multi-frame response exceeded {limit} ({frames} frames, {bytes} bytes)")]
    AssemblyOverflow { limit: AssemblyLimit, frames: usize, bytes: usize },

    #[error("Multi-frame response has a gap: expected fragment {expected}, received {received}")]
    AssemblyGap { expected: u8, received: u8 },

    #[error("Command was cancelled by the caller")]
    Cancelled,

    #[error("Command queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Invalid configuration: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Command cannot be encoded: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine worker has stopped")]
    EngineStopped,
}

/// Which bound of the response assembler was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyLimit {
    Frames,
    Bytes,
}

impl std::fmt::Display for AssemblyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblyLimit::Frames => f.write_str("frame limit"),
            AssemblyLimit::Bytes => f.write_str("byte limit"),
        }
    }
}

impl PumpError {
    /// Returns whether resubmitting the same command may succeed.
    ///
    /// Side-effecting commands should still be reconciled against the pump's
    /// own history before a resubmission, see [`PumpError::may_have_been_delivered`].
    pub fn is_retryable(&self) -> bool {
        match self {
            PumpError::SessionNotReady { .. } => true,
            PumpError::Exhausted { .. } => true,
            PumpError::Disconnected => true,
            PumpError::AssemblyOverflow { .. } => true,
            PumpError::AssemblyGap { .. } => true,
            PumpError::QueueFull { .. } => true,
            PumpError::Transport(_) => true,
            PumpError::Rejected { .. } => false,
            PumpError::Cancelled => false,
            PumpError::Encode(_) => false,
            PumpError::Config { .. } => false,
            PumpError::EngineStopped => false,
        }
    }

    /// Returns whether the pump may have executed the command despite the failure.
    pub fn may_have_been_delivered(&self) -> bool {
        match self {
            PumpError::Exhausted { may_have_been_delivered, .. } => *may_have_been_delivered,
            PumpError::Disconnected | PumpError::Cancelled | PumpError::Transport(_) => true,
            _ => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            PumpError::SessionNotReady { .. } => vec![
                "Wait for the session to become established and resubmit",
                "Reset the session if it has expired",
            ],
            PumpError::Exhausted { .. } => vec![
                "Check pump history before resubmitting a delivery command",
                "Move the phone closer to the pump",
                "Increase the retry timeout for slow commands",
            ],
            PumpError::Disconnected => vec![
                "Reconnect the transport and pair again",
                "Check pump history before resubmitting a delivery command",
            ],
            PumpError::Rejected { .. } => vec![
                "Inspect the pump's rejection code",
                "Verify the command parameters against pump settings",
            ],
            PumpError::AssemblyOverflow { .. } | PumpError::AssemblyGap { .. } => vec![
                "Request the history page again",
                "Raise the assembly limits if the pump legitimately sends larger pages",
            ],
            PumpError::Cancelled => vec!["Resubmit the command if it is still needed"],
            PumpError::Encode(_) => vec![
                "Check the payload size against the family's max_payload",
                "Check the opcode fits the family's opcode width",
            ],
            PumpError::QueueFull { .. } => vec![
                "Wait for pending commands to complete",
                "Increase the queue capacity",
            ],
            PumpError::Config { .. } => vec![
                "Check the configuration file for typos",
                "Compare against the built-in family presets",
            ],
            PumpError::Transport(_) => vec![
                "Check the Bluetooth or serial link",
                "Reconnect the transport",
            ],
            PumpError::EngineStopped => vec!["Open a new pump connection"],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        PumpError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        PumpError::Config { reason: reason.into(), source: Some(source) }
    }
}

impl From<serde_yaml_ng::Error> for PumpError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        PumpError::config_with_source("YAML could not be parsed", Box::new(err))
    }
}

/// Protocol noise produced while decoding inbound bytes.
///
/// Decode errors drop the offending frame. They never fail a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Malformed frame: {reason}")]
    Malformed { reason: MalformedReason },

    #[error("Unexpected frame {opcode} (sequence {sequence}): {reason}")]
    Unexpected { opcode: Opcode, sequence: u16, reason: &'static str },
}

/// Why a record failed structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    TooShort { len: usize, min: usize },
    LengthMismatch { declared: usize, actual: usize },
    PayloadTooLarge { declared: usize, max: usize },
    BadSync,
    IntegrityMismatch { expected: u32, computed: u32 },
    DecryptionFailed,
    MissingSessionKey,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedReason::TooShort { len, min } => {
                write!(f, "record of {} bytes is shorter than minimum {}", len, min)
            }
            MalformedReason::LengthMismatch { declared, actual } => {
                write!(f, "declared length {} but {} payload bytes present", declared, actual)
            }
            MalformedReason::PayloadTooLarge { declared, max } => {
                write!(f, "declared payload {} exceeds maximum {}", declared, max)
            }
            MalformedReason::BadSync => f.write_str("sync prefix not found"),
            MalformedReason::IntegrityMismatch { expected, computed } => {
                write!(f, "integrity {:#06x} does not match computed {:#06x}", expected, computed)
            }
            MalformedReason::DecryptionFailed => f.write_str("authenticated decryption failed"),
            MalformedReason::MissingSessionKey => {
                f.write_str("encrypted record without an established session key")
            }
        }
    }
}

impl DecodeError {
    pub(crate) fn malformed(reason: MalformedReason) -> Self {
        DecodeError::Malformed { reason }
    }
}

/// A command that cannot be turned into a record for the current family.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds the family maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("opcode {opcode} does not fit the family's opcode field")]
    OpcodeTooWide { opcode: Opcode },

    #[error("session key is not available")]
    MissingSessionKey,
}

/// Failure reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("Write of {len} bytes failed: {reason}")]
    Write { len: usize, reason: String },

    #[error("Transport timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
