//! Packet codec.
//!
//! One codec implementation serves every pump family; the
//! [`FamilyDescriptor`] supplies the parameters. Records look like:
//!
//! ```text
//! [sync][opcode 1|2][flags][sequence u16][fragment][length u16][tag?][payload][integrity 1|2]
//! ```
//!
//! - Multi-byte header fields are big-endian.
//! - `tag` is present only on encrypted records and identifies the session key.
//! - `integrity` covers everything after the sync prefix, ciphertext
//!   included, and is always verified before decryption is attempted.
//! - The codec exposes the continuation flag but never reassembles; see
//!   [`crate::assembler`].

pub mod cipher;
mod reader;

pub use reader::FrameReader;

use std::sync::Arc;
use tracing::trace;

use crate::error::{DecodeError, EncodeError, MalformedReason};
use crate::family::{AEAD_TAG_LEN, FamilyDescriptor, OpcodeWidth};
use crate::session::Session;
use crate::types::{Command, Frame, FrameFlags, Opcode};
use cipher::{RecordNonce, SessionCipher};

/// Fields of a record before it is serialised.
#[derive(Debug, Clone, Copy)]
pub struct OutboundRecord<'a> {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub sequence: u16,
    pub fragment: u8,
    pub payload: &'a [u8],
}

/// Encoder/decoder for one family's records.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    family: Arc<FamilyDescriptor>,
}

impl PacketCodec {
    pub fn new(family: Arc<FamilyDescriptor>) -> Self {
        Self { family }
    }

    pub fn family(&self) -> &FamilyDescriptor {
        &self.family
    }

    /// Encode a host command under `sequence`.
    ///
    /// The payload is sealed when the family is encrypted and the command is
    /// not part of the handshake.
    pub fn encode(&self, command: &Command, sequence: u16, session: &Session) -> Result<Vec<u8>, EncodeError> {
        let record = OutboundRecord {
            opcode: command.opcode(),
            flags: FrameFlags::default(),
            sequence,
            fragment: 0,
            payload: command.payload(),
        };
        let cipher = if self.family.encrypted && command.opcode() != self.family.handshake_opcode {
            Some(session.cipher().ok_or(EncodeError::MissingSessionKey)?)
        } else {
            None
        };
        self.encode_record(&record, cipher)
    }

    /// Handshake request carrying the client nonce; always plaintext, sequence 0.
    pub fn encode_handshake(&self, client_nonce: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let record = OutboundRecord {
            opcode: self.family.handshake_opcode,
            flags: FrameFlags::default(),
            sequence: 0,
            fragment: 0,
            payload: client_nonce,
        };
        self.encode_record(&record, None)
    }

    /// Serialise a record, sealing the payload with `cipher` when given.
    pub fn encode_record(
        &self,
        record: &OutboundRecord<'_>,
        cipher: Option<&SessionCipher>,
    ) -> Result<Vec<u8>, EncodeError> {
        let family = &self.family;
        if !family.opcode_width.fits(record.opcode) {
            return Err(EncodeError::OpcodeTooWide { opcode: record.opcode });
        }
        if record.payload.len() > family.max_payload {
            return Err(EncodeError::PayloadTooLarge {
                len: record.payload.len(),
                max: family.max_payload,
            });
        }

        let wire_len = record.payload.len() + if cipher.is_some() { AEAD_TAG_LEN } else { 0 };
        let flags = record.flags.with(FrameFlags::ENCRYPTED, cipher.is_some());
        let mut out = Vec::with_capacity(family.header_len() + 1 + wire_len + family.integrity.len());

        out.extend_from_slice(&family.sync);
        let body_start = out.len();
        match family.opcode_width {
            OpcodeWidth::One => out.push(record.opcode.0 as u8),
            OpcodeWidth::Two => out.extend_from_slice(&record.opcode.0.to_be_bytes()),
        }
        out.push(flags.value());
        out.extend_from_slice(&record.sequence.to_be_bytes());
        out.push(record.fragment);
        out.extend_from_slice(&(wire_len as u16).to_be_bytes());

        match cipher {
            Some(cipher) => {
                out.push(cipher.key_id());
                let position = RecordNonce {
                    from_pump: flags.has(FrameFlags::FROM_PUMP),
                    fragment: record.fragment,
                    sequence: record.sequence,
                };
                let sealed = cipher
                    .seal(position, &out[body_start..], record.payload)
                    .ok_or(EncodeError::MissingSessionKey)?;
                out.extend_from_slice(&sealed);
            }
            None => out.extend_from_slice(record.payload),
        }

        family.integrity.append(body_start, &mut out);
        trace!("Encoded {} seq={} ({} bytes)", record.opcode, record.sequence, out.len());
        Ok(out)
    }

    /// Total length of the record starting at `buf[0]`, read from its header.
    ///
    /// `buf` must hold at least `header_len()` bytes.
    pub fn record_len(&self, buf: &[u8]) -> Result<usize, DecodeError> {
        let family = &self.family;
        let header_len = family.header_len();
        if buf.len() < header_len {
            return Err(DecodeError::malformed(MalformedReason::TooShort {
                len: buf.len(),
                min: header_len,
            }));
        }
        let flags = FrameFlags(buf[family.sync.len() + family.opcode_width.len()]);
        let declared = usize::from(u16::from_be_bytes([buf[header_len - 2], buf[header_len - 1]]));
        if declared > family.max_wire_payload() {
            return Err(DecodeError::malformed(MalformedReason::PayloadTooLarge {
                declared,
                max: family.max_wire_payload(),
            }));
        }
        let tag_len = usize::from(flags.has(FrameFlags::ENCRYPTED));
        Ok(header_len + tag_len + declared + family.integrity.len())
    }

    /// Decode one complete record.
    pub fn decode(&self, bytes: &[u8], session: &Session) -> Result<Frame, DecodeError> {
        let family = &self.family;
        let min = family.min_record_len();
        if bytes.len() < min {
            return Err(DecodeError::malformed(MalformedReason::TooShort { len: bytes.len(), min }));
        }
        if !bytes.starts_with(&family.sync) {
            return Err(DecodeError::malformed(MalformedReason::BadSync));
        }

        let total = self.record_len(bytes)?;
        if total != bytes.len() {
            let header_len = family.header_len();
            return Err(DecodeError::malformed(MalformedReason::LengthMismatch {
                declared: total - header_len - family.integrity.len(),
                actual: bytes.len().saturating_sub(header_len + family.integrity.len()),
            }));
        }

        let body_start = family.sync.len();
        let integrity_at = bytes.len() - family.integrity.len();
        let expected = family.integrity.read(&bytes[integrity_at..]);
        let computed = family.integrity.compute(&bytes[body_start..integrity_at]);
        if expected != computed {
            return Err(DecodeError::malformed(MalformedReason::IntegrityMismatch { expected, computed }));
        }

        let mut cursor = body_start;
        let opcode = match family.opcode_width {
            OpcodeWidth::One => Opcode(u16::from(bytes[cursor])),
            OpcodeWidth::Two => Opcode(u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]])),
        };
        cursor += family.opcode_width.len();
        let flags = FrameFlags(bytes[cursor]);
        let sequence = u16::from_be_bytes([bytes[cursor + 1], bytes[cursor + 2]]);
        let fragment = bytes[cursor + 3];
        let header_end = family.header_len();

        let payload = if flags.has(FrameFlags::ENCRYPTED) {
            let tag = bytes[header_end];
            let Some(cipher) = session.cipher() else {
                return Err(DecodeError::malformed(MalformedReason::MissingSessionKey));
            };
            if tag != cipher.key_id() {
                return Err(DecodeError::Unexpected { opcode, sequence, reason: "record sealed under another session" });
            }
            let position = RecordNonce { from_pump: flags.has(FrameFlags::FROM_PUMP), fragment, sequence };
            cipher
                .open(position, &bytes[body_start..=header_end], &bytes[header_end + 1..integrity_at])
                .ok_or(DecodeError::malformed(MalformedReason::DecryptionFailed))?
        } else {
            if family.encrypted && session.is_established() && opcode != family.handshake_opcode {
                return Err(DecodeError::Unexpected { opcode, sequence, reason: "plaintext record on an encrypted session" });
            }
            bytes[header_end..integrity_at].to_vec()
        };

        trace!("Decoded {} seq={} frag={} ({} payload bytes)", opcode, sequence, fragment, payload.len());
        Ok(Frame { opcode, flags, sequence, fragment, payload })
    }

    /// Decode a record that must answer `expected`.
    pub fn decode_expecting(
        &self,
        bytes: &[u8],
        session: &Session,
        expected: Opcode,
    ) -> Result<Frame, DecodeError> {
        let frame = self.decode(bytes, session)?;
        if frame.opcode != expected {
            return Err(DecodeError::Unexpected {
                opcode: frame.opcode,
                sequence: frame.sequence,
                reason: "opcode does not match the pending command",
            });
        }
        Ok(frame)
    }

    /// Pull the next record out of `reader`, re-synchronising past malformed bytes.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&self, reader: &mut FrameReader, session: &Session) -> Option<Result<Frame, DecodeError>> {
        let sync = &self.family.sync;
        if !sync.is_empty() {
            match reader.find(sync) {
                Some(0) => {}
                Some(offset) => {
                    trace!("Skipping {} bytes before sync", offset);
                    reader.discard(offset);
                }
                None => {
                    let keep = sync.len() - 1;
                    reader.discard(reader.len().saturating_sub(keep));
                    return None;
                }
            }
        }
        if reader.len() < self.family.header_len() {
            return None;
        }

        let total = match self.record_len(reader.bytes()) {
            Ok(total) => total,
            Err(err) => {
                self.resync(reader);
                return Some(Err(err));
            }
        };
        if reader.len() < total {
            return None;
        }

        let result = self.decode(&reader.bytes()[..total], session);
        match result {
            Err(DecodeError::Malformed { .. }) => self.resync(reader),
            _ => reader.discard(total),
        }
        Some(result)
    }

    fn resync(&self, reader: &mut FrameReader) {
        if self.family.sync.is_empty() {
            reader.clear();
        } else {
            reader.discard(1);
        }
    }
}
