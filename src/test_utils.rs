//! Shared helpers for unit tests and benchmarks

#![cfg(any(test, feature = "benchmark"))]

use crate::family::FamilyDescriptor;
use crate::session::Session;

/// Secret used by [`established_sessions`].
pub const TEST_PAIRING_SECRET: &[u8] = b"pumplink-test-secret";

/// Host and pump sessions that completed a handshake with each other.
pub fn established_sessions(family: &FamilyDescriptor) -> (Session, Session) {
    let mut host = Session::new(family, TEST_PAIRING_SECRET);
    let mut pump = Session::new(family, TEST_PAIRING_SECRET);
    let nonce = host.begin_handshake().expect("fresh session accepts a handshake");
    let answer = pump.accept_handshake(&nonce).expect("pump accepts a well-formed nonce");
    host.complete_handshake(&answer).expect("host accepts the pump's answer");
    (host, pump)
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
