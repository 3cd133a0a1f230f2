//! Core data types shared by the codec, dispatcher and status store.
//!
//! ## Overview
//!
//! - [`Command`] is what a caller submits: opcode, payload, response shape,
//!   retry policy and whether it changes pump state.
//! - [`Frame`] is one validated record decoded from the wire.
//! - [`Message`] is a complete logical response, possibly assembled from
//!   several continuation frames.
//! - [`Response`] wraps a message with the attempt count and a duplicate hint.
//! - [`StatusSnapshot`] is the coalesced last-known pump state.
//!
//! ## Usage Example
//!
//! ```rust
//! use pumplink::types::{Command, Opcode, RetryPolicy};
//! use std::time::Duration;
//!
//! let bolus = Command::new(0x0102, vec![0x00, 0x64])
//!     .with_policy(RetryPolicy::new(Duration::from_millis(800), 2))
//!     .side_effecting();
//!
//! assert_eq!(bolus.opcode(), Opcode(0x0102));
//! assert!(bolus.is_side_effecting());
//! ```

mod command;
mod frame;
mod opcode;
mod session_state;
mod status;
mod temp_basal;

pub use command::{Command, CommandId, DeliveryClass, ResponseShape, RetryPolicy};
pub use frame::{Frame, FrameFlags, Message, Response};
pub use opcode::Opcode;
pub use session_state::SessionState;
pub use status::{StatusField, StatusSnapshot};
pub use temp_basal::TempBasalDescriptor;
