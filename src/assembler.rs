//! Multi-frame response reassembly
//!
//! Continuation frames are accumulated per sequence number until the terminal
//! frame arrives. Every retransmission of a command gets a fresh sequence, so
//! pages from different attempts never mix. Fragments must arrive in order
//! starting at 0; anything else fails the command instead of producing a
//! truncated message.

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::config::AssemblyConfig;
use crate::error::{AssemblyLimit, PumpError};
use crate::types::{Frame, Message, Opcode};

/// Outcome of feeding one frame to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyProgress {
    /// More fragments are expected.
    Pending,
    Complete(Message),
}

#[derive(Debug)]
struct Partial {
    opcode: Opcode,
    next_fragment: u8,
    payload: Vec<u8>,
    frames: usize,
}

/// Reassembles paged responses under frame-count and byte bounds.
#[derive(Debug)]
pub struct ResponseAssembler {
    limits: AssemblyConfig,
    partials: HashMap<u16, Partial>,
}

impl ResponseAssembler {
    pub fn new(limits: AssemblyConfig) -> Self {
        Self { limits, partials: HashMap::new() }
    }

    pub fn push(&mut self, frame: Frame) -> Result<AssemblyProgress, PumpError> {
        let sequence = frame.sequence;
        let mut partial = self.partials.remove(&sequence).unwrap_or(Partial {
            opcode: frame.opcode,
            next_fragment: 0,
            payload: Vec::new(),
            frames: 0,
        });

        if frame.fragment != partial.next_fragment {
            debug!(
                "Fragment gap on seq={}: expected {}, got {}",
                sequence, partial.next_fragment, frame.fragment
            );
            return Err(PumpError::AssemblyGap { expected: partial.next_fragment, received: frame.fragment });
        }

        let frames = partial.frames + 1;
        let bytes = partial.payload.len() + frame.payload.len();
        if frames > self.limits.max_frames {
            return Err(PumpError::AssemblyOverflow { limit: AssemblyLimit::Frames, frames, bytes });
        }
        if bytes > self.limits.max_bytes {
            return Err(PumpError::AssemblyOverflow { limit: AssemblyLimit::Bytes, frames, bytes });
        }

        partial.payload.extend_from_slice(&frame.payload);
        partial.frames = frames;

        if frame.is_terminal() {
            trace!("Assembled seq={} from {} frame(s), {} bytes", sequence, frames, bytes);
            return Ok(AssemblyProgress::Complete(Message {
                opcode: partial.opcode,
                sequence,
                payload: partial.payload,
                frames,
            }));
        }

        // a terminal fragment 255 is still representable; a continuation is not
        let Some(next) = partial.next_fragment.checked_add(1) else {
            return Err(PumpError::AssemblyOverflow { limit: AssemblyLimit::Frames, frames, bytes });
        };
        partial.next_fragment = next;
        self.partials.insert(sequence, partial);
        Ok(AssemblyProgress::Pending)
    }

    /// Whether fragments are buffered for any sequence.
    pub fn in_progress(&self) -> bool {
        !self.partials.is_empty()
    }

    /// Drop all buffered fragments, e.g. when the owning command resolves.
    pub fn reset(&mut self) {
        self.partials.clear();
    }
}
