//! Commands submitted to the dispatcher

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::Opcode;

/// Timeout and retry budget for one command.
///
/// A command is transmitted at most `max_attempts` times. Each attempt waits
/// `timeout_ms` for a correlated response before the next one is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Timeouts beyond `u64::MAX` milliseconds saturate.
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        Self { timeout_ms, max_attempts: max_attempts.max(1) }
    }

    /// Per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Worst-case time until the command resolves `Exhausted`.
    pub fn total_budget(&self) -> Duration {
        self.timeout().saturating_mul(self.max_attempts.max(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { timeout_ms: 2_000, max_attempts: 3 }
    }
}

/// Whether executing a command changes pump state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryClass {
    /// Read-only request; duplicates are harmless.
    #[default]
    Query,
    /// Bolus, basal or setting change. Retries are reported to the caller.
    SideEffecting,
}

/// Shape of the response the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseShape {
    #[default]
    Single,
    /// Paged response that may span several continuation frames.
    MultiFrame,
}

/// Identifier assigned to a command when it is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable request for the pump.
///
/// Built with [`Command::new`] and the consuming `with_*` methods. Once handed
/// to [`PumpConnection::submit`](crate::PumpConnection::submit) it is owned by
/// the dispatcher until it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    payload: Arc<[u8]>,
    shape: ResponseShape,
    class: DeliveryClass,
    policy: Option<RetryPolicy>,
}

impl Command {
    pub fn new(opcode: impl Into<Opcode>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode: opcode.into(),
            payload: payload.into().into(),
            shape: ResponseShape::Single,
            class: DeliveryClass::Query,
            policy: None,
        }
    }

    /// Read-only query with an empty payload.
    pub fn query(opcode: impl Into<Opcode>) -> Self {
        Self::new(opcode, Vec::new())
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_shape(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn side_effecting(mut self) -> Self {
        self.class = DeliveryClass::SideEffecting;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    pub fn class(&self) -> DeliveryClass {
        self.class
    }

    /// Explicit policy, if the caller set one. The engine default applies otherwise.
    pub fn policy(&self) -> Option<RetryPolicy> {
        self.policy
    }

    pub fn is_side_effecting(&self) -> bool {
        self.class == DeliveryClass::SideEffecting
    }
}
