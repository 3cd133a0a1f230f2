//! Session and encryption state machine
//!
//! One [`Session`] exists per physical connection. It owns the key material,
//! the monotonic sequence counter and the [`SessionState`] tag. The same type
//! serves both ends of the link: the host drives
//! [`begin_handshake`](Session::begin_handshake) /
//! [`complete_handshake`](Session::complete_handshake), a simulated pump
//! answers with [`accept_handshake`](Session::accept_handshake).
//!
//! ## Handshake payloads
//!
//! - host → pump: `[client nonce; 16]`
//! - pump → host: `[status u8][pump nonce; 16][client nonce echo; 16]`,
//!   status `0` accepts
//!
//! A timed-out handshake is retransmitted with the same client nonce, so a
//! late answer to any attempt of the round still derives the key the pump
//! holds. Answers echoing another nonce are stale and change nothing.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::cipher::{HANDSHAKE_NONCE_LEN, SessionCipher, derive_session_key};
use crate::family::FamilyDescriptor;
use crate::types::SessionState;

/// Handshake status byte meaning "accepted".
pub const HANDSHAKE_ACCEPTED: u8 = 0x00;

/// Why a session left the established state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Disconnected,
    SequenceExhausted,
    RekeyRejected { code: u8 },
}

/// Session transition errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is {state}, expected {expected}")]
    WrongState { state: SessionState, expected: SessionState },

    #[error("pump rejected the handshake with code {code:#04x}")]
    Rejected { code: u8 },

    #[error("handshake payload of {len} bytes is truncated")]
    Truncated { len: usize },

    #[error("handshake answer echoes another client nonce")]
    StaleAnswer,

    #[error("sequence counter exhausted")]
    SequenceExhausted,
}

/// Key material, sequence counter and state for one connection.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    encrypted: bool,
    max_sequence: u16,
    pairing_secret: Vec<u8>,
    epoch: u8,
    next_sequence: u32,
    client_nonce: Option<[u8; HANDSHAKE_NONCE_LEN]>,
    pump_nonce: Option<[u8; HANDSHAKE_NONCE_LEN]>,
    cipher: Option<SessionCipher>,
}

impl Session {
    pub fn new(family: &FamilyDescriptor, pairing_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            state: SessionState::Unpaired,
            encrypted: family.encrypted,
            max_sequence: family.max_sequence,
            pairing_secret: pairing_secret.into(),
            epoch: 0,
            next_sequence: 1,
            client_nonce: None,
            pump_nonce: None,
            cipher: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    /// Number of times this session has been established.
    pub fn epoch(&self) -> u8 {
        self.epoch
    }

    /// Header tag of sealed records for the current key.
    pub fn tag(&self) -> Option<u8> {
        self.cipher().map(SessionCipher::key_id)
    }

    /// Cipher for sealing records, present only while established on an encrypted family.
    pub fn cipher(&self) -> Option<&SessionCipher> {
        if self.is_established() { self.cipher.as_ref() } else { None }
    }

    /// `Unpaired → Handshaking`. Returns the client nonce to send.
    pub fn begin_handshake(&mut self) -> Result<[u8; HANDSHAKE_NONCE_LEN], SessionError> {
        self.expect_state(SessionState::Unpaired)?;
        let nonce: [u8; HANDSHAKE_NONCE_LEN] = rand::random();
        self.client_nonce = Some(nonce);
        self.transition(SessionState::Handshaking);
        Ok(nonce)
    }

    /// Client nonce of the handshake in progress, for retransmission.
    pub fn handshake_nonce(&self) -> Option<[u8; HANDSHAKE_NONCE_LEN]> {
        if self.state == SessionState::Handshaking { self.client_nonce } else { None }
    }

    /// Host side: consume the pump's handshake answer.
    ///
    /// Acceptance derives the key and moves to `Established` with the sequence
    /// counter reset; rejection or a truncated answer falls back to `Unpaired`.
    /// An answer echoing another client nonce is [`SessionError::StaleAnswer`]
    /// and leaves the handshake running.
    pub fn complete_handshake(&mut self, response: &[u8]) -> Result<(), SessionError> {
        self.expect_state(SessionState::Handshaking)?;
        let pump_nonce = match self.read_answer(response) {
            Ok(pump_nonce) => pump_nonce,
            Err(SessionError::StaleAnswer) => return Err(SessionError::StaleAnswer),
            Err(err) => {
                if let SessionError::Rejected { code } = err {
                    warn!("Handshake rejected by pump (code {:#04x})", code);
                }
                self.fail_handshake();
                return Err(err);
            }
        };
        let client_nonce = self.client_nonce.unwrap_or([0; HANDSHAKE_NONCE_LEN]);
        self.establish(&client_nonce, &pump_nonce);
        Ok(())
    }

    /// Host side: an accepting answer that arrives after establishment.
    ///
    /// The pump re-keys whenever it accepts a handshake request, so an answer
    /// to this session's client nonce carrying a new pump nonce moves the host
    /// to the same key. Returns `false` for a repeat of the current answer.
    pub fn follow_rekey(&mut self, response: &[u8]) -> Result<bool, SessionError> {
        self.expect_state(SessionState::Established)?;
        let pump_nonce = self.read_answer(response)?;
        if self.pump_nonce == Some(pump_nonce) {
            return Ok(false);
        }
        let client_nonce = self.client_nonce.unwrap_or([0; HANDSHAKE_NONCE_LEN]);
        info!("Pump re-keyed the session");
        self.establish(&client_nonce, &pump_nonce);
        Ok(true)
    }

    /// Pump side: accept a client nonce and establish. Returns the handshake answer.
    pub fn accept_handshake(&mut self, request: &[u8]) -> Result<Vec<u8>, SessionError> {
        let client_nonce = <[u8; HANDSHAKE_NONCE_LEN]>::try_from(request)
            .map_err(|_| SessionError::Truncated { len: request.len() })?;
        let pump_nonce: [u8; HANDSHAKE_NONCE_LEN] = rand::random();
        self.client_nonce = Some(client_nonce);
        self.establish(&client_nonce, &pump_nonce);

        let mut answer = Vec::with_capacity(1 + 2 * HANDSHAKE_NONCE_LEN);
        answer.push(HANDSHAKE_ACCEPTED);
        answer.extend_from_slice(&pump_nonce);
        answer.extend_from_slice(&client_nonce);
        Ok(answer)
    }

    /// `Handshaking → Unpaired` after a timeout or rejection.
    pub fn fail_handshake(&mut self) {
        if self.state == SessionState::Handshaking {
            self.client_nonce = None;
            self.transition(SessionState::Unpaired);
        }
    }

    /// Move to the terminal `Expired` state and drop key material.
    pub fn expire(&mut self, reason: ExpiryReason) {
        if self.state != SessionState::Expired {
            info!("Session expired: {:?}", reason);
            self.cipher = None;
            self.client_nonce = None;
            self.pump_nonce = None;
            self.transition(SessionState::Expired);
        }
    }

    /// External re-pairing: any state back to `Unpaired`.
    pub fn reset(&mut self) {
        self.cipher = None;
        self.client_nonce = None;
        self.pump_nonce = None;
        self.next_sequence = 1;
        self.transition(SessionState::Unpaired);
    }

    /// Allocate the next record sequence number.
    ///
    /// Running past the family's `max_sequence` expires the session, since
    /// the nonce space for this key is used up.
    pub fn next_sequence(&mut self) -> Result<u16, SessionError> {
        self.expect_state(SessionState::Established)?;
        if self.next_sequence > u32::from(self.max_sequence) {
            self.expire(ExpiryReason::SequenceExhausted);
            return Err(SessionError::SequenceExhausted);
        }
        let sequence = self.next_sequence as u16;
        self.next_sequence += 1;
        Ok(sequence)
    }

    fn establish(
        &mut self,
        client_nonce: &[u8; HANDSHAKE_NONCE_LEN],
        pump_nonce: &[u8; HANDSHAKE_NONCE_LEN],
    ) {
        self.epoch = self.epoch.wrapping_add(1);
        self.next_sequence = 1;
        self.pump_nonce = Some(*pump_nonce);
        self.cipher = if self.encrypted {
            let key = derive_session_key(&self.pairing_secret, client_nonce, pump_nonce);
            Some(SessionCipher::new(key))
        } else {
            None
        };
        self.transition(SessionState::Established);
    }

    /// Pump nonce of an accepting answer to the current client nonce.
    fn read_answer(&self, response: &[u8]) -> Result<[u8; HANDSHAKE_NONCE_LEN], SessionError> {
        let Some((&status, rest)) = response.split_first() else {
            return Err(SessionError::Truncated { len: response.len() });
        };
        if status != HANDSHAKE_ACCEPTED {
            return Err(SessionError::Rejected { code: status });
        }
        if rest.len() < 2 * HANDSHAKE_NONCE_LEN {
            return Err(SessionError::Truncated { len: response.len() });
        }
        let (pump_nonce, echo) = rest.split_at(HANDSHAKE_NONCE_LEN);
        if self.client_nonce.as_ref().map(|nonce| nonce.as_slice()) != Some(&echo[..HANDSHAKE_NONCE_LEN]) {
            return Err(SessionError::StaleAnswer);
        }
        let mut nonce = [0; HANDSHAKE_NONCE_LEN];
        nonce.copy_from_slice(pump_nonce);
        Ok(nonce)
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::WrongState { state: self.state, expected })
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session {} -> {} (epoch {})", self.state, next, self.epoch);
            self.state = next;
        }
    }
}
