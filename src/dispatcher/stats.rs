//! Link counters

use serde::Serialize;

/// Running counters for one connection, published after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Records dropped for length, integrity or decryption failures.
    pub malformed: u64,
    /// Valid records that answered nothing in flight.
    pub unexpected: u64,
    /// Retransmissions after a timeout.
    pub retries: u64,
    pub completed: u64,
    pub failed: u64,
}
