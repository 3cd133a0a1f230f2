//! Decoded frames and assembled messages

use super::Opcode;

/// Header flag bits carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// More fragments of the same response follow.
    pub const CONTINUATION: u8 = 0x01;
    /// Payload is sealed with the session key.
    pub const ENCRYPTED: u8 = 0x02;
    /// The pump refused the command; first payload byte is its reason code.
    pub const NACK: u8 = 0x04;
    /// Record travels pump to host.
    pub const FROM_PUMP: u8 = 0x08;

    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn has(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn with(self, flag: u8, enabled: bool) -> Self {
        if enabled { Self(self.0 | flag) } else { Self(self.0 & !flag) }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// One record that passed length and integrity validation.
///
/// Frames are only produced for records whose integrity check succeeded, and
/// for encrypted records only after authenticated decryption. They are
/// consumed immediately by the dispatcher or the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub sequence: u16,
    /// Position within a multi-frame response, starting at 0.
    pub fragment: u8,
    /// Plaintext payload.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_continuation(&self) -> bool {
        self.flags.has(FrameFlags::CONTINUATION)
    }

    /// Last (or only) frame of a response.
    pub fn is_terminal(&self) -> bool {
        !self.is_continuation()
    }

    pub fn is_nack(&self) -> bool {
        self.flags.has(FrameFlags::NACK)
    }

    pub fn is_from_pump(&self) -> bool {
        self.flags.has(FrameFlags::FROM_PUMP)
    }

    pub fn was_encrypted(&self) -> bool {
        self.flags.has(FrameFlags::ENCRYPTED)
    }

    /// Reason code of a NACK, `0` when the pump sent none.
    pub fn nack_code(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }
}

/// A complete logical response, possibly reassembled from several frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub sequence: u16,
    pub payload: Vec<u8>,
    /// Number of frames the response arrived in.
    pub frames: usize,
}

/// Successful outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: Message,
    /// Transmissions performed before the response arrived.
    pub attempts: u32,
    /// The command changes pump state and was transmitted more than once.
    ///
    /// The engine cannot tell "accepted, ack lost" apart from "never
    /// received", so upstream logic should reconcile against pump history.
    pub possibly_duplicated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_operations() {
        let flags = FrameFlags::default()
            .with(FrameFlags::CONTINUATION, true)
            .with(FrameFlags::FROM_PUMP, true);
        assert!(flags.has(FrameFlags::CONTINUATION));
        assert!(flags.has(FrameFlags::FROM_PUMP));
        assert!(!flags.has(FrameFlags::NACK));

        let cleared = flags.with(FrameFlags::CONTINUATION, false);
        assert!(!cleared.has(FrameFlags::CONTINUATION));
        assert_eq!(cleared.value(), FrameFlags::FROM_PUMP);
    }

    #[test]
    fn terminal_and_nack() {
        let frame = Frame {
            opcode: Opcode(0x41),
            flags: FrameFlags(FrameFlags::NACK),
            sequence: 7,
            fragment: 0,
            payload: vec![0x22],
        };
        assert!(frame.is_terminal());
        assert!(frame.is_nack());
        assert_eq!(frame.nack_code(), 0x22);

        let empty = Frame { payload: Vec::new(), ..frame };
        assert_eq!(empty.nack_code(), 0);
    }
}
