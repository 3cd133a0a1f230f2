//! Byte accumulator between transport chunks and records

use tracing::warn;

/// Default bound on buffered bytes.
pub const DEFAULT_MAX_BUFFER: usize = 8 * 1024;

/// Buffers inbound transport chunks until complete records are available.
///
/// Record boundaries are found by [`PacketCodec::next_frame`](super::PacketCodec::next_frame);
/// the reader only stores bytes and bounds memory.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_buffer: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_BUFFER)
    }
}

impl FrameReader {
    pub fn with_capacity(max_buffer: usize) -> Self {
        Self { buf: Vec::new(), max_buffer: max_buffer.max(1) }
    }

    /// Append a chunk, dropping the oldest bytes if the bound is exceeded.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer {
            let excess = self.buf.len() - self.max_buffer;
            warn!("Inbound buffer over {} bytes, dropping {} oldest", self.max_buffer, excess);
            self.buf.drain(..excess);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn discard(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.drain(..count);
    }

    /// Offset of the first occurrence of `pattern`.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() {
            return Some(0);
        }
        self.buf.windows(pattern.len()).position(|window| window == pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_keeps_newest_bytes() {
        let mut reader = FrameReader::with_capacity(4);
        reader.push(&[1, 2, 3]);
        reader.push(&[4, 5, 6]);
        assert_eq!(reader.bytes(), &[3, 4, 5, 6]);
    }

    #[test]
    fn find_and_discard() {
        let mut reader = FrameReader::default();
        reader.push(&[0, 0x7E, 0x7E, 9]);
        assert_eq!(reader.find(&[0x7E, 0x7E]), Some(1));
        reader.discard(1);
        assert_eq!(reader.find(&[0x7E, 0x7E]), Some(0));
        reader.discard(100);
        assert!(reader.is_empty());
    }
}
