//! # Command Stream
//!
//! Linear command buffer that encoders append method words to.

use alloc::vec::Vec;

use ember_core::{ByteSize, Error, GpuAddr, Result};

/// Bytes per command word
pub const WORD_SIZE: usize = 4;

// =============================================================================
// METHOD HEADER
// =============================================================================

/// Build an incrementing-method header word
#[inline]
pub const fn method_header(method: u16, subchannel: u8, count: u16) -> u32 {
    (1 << 29) | ((count as u32 & 0x1FFF) << 16) | ((subchannel as u32 & 0x7) << 13) | ((method as u32) >> 2)
}

/// Decode the method address from a header word
#[inline]
pub const fn header_method(header: u32) -> u16 {
    ((header & 0x1FFF) << 2) as u16
}

// =============================================================================
// COMMAND STREAM
// =============================================================================

/// Linear region of command words with a fixed capacity
#[derive(Debug)]
pub struct CommandStream {
    /// Pool-assigned identifier
    id: u32,
    /// GPU address of the first word
    gpu_base: GpuAddr,
    /// Encoded words
    words: Vec<u32>,
    /// Capacity in words
    capacity: usize,
}

impl CommandStream {
    /// Create an empty stream of `size` bytes
    pub fn new(id: u32, gpu_base: GpuAddr, size: ByteSize) -> Self {
        let capacity = size.as_bytes() as usize / WORD_SIZE;
        Self {
            id,
            gpu_base,
            words: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Pool-assigned identifier
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// GPU address of the first word
    #[inline]
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// GPU address of the next word to be written
    #[inline]
    pub fn gpu_cursor(&self) -> GpuAddr {
        self.gpu_base.offset(self.used_bytes() as u64)
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity * WORD_SIZE
    }

    /// Bytes written so far
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Words written so far
    #[inline]
    pub fn used_words(&self) -> usize {
        self.words.len()
    }

    /// Bytes still available
    #[inline]
    pub fn available_bytes(&self) -> usize {
        self.capacity_bytes() - self.used_bytes()
    }

    /// Check if nothing has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Fail unless `bytes` more bytes fit
    pub fn ensure_space(&self, bytes: usize) -> Result<()> {
        if bytes > self.available_bytes() {
            return Err(Error::CommandBufferFull);
        }
        Ok(())
    }

    /// Append a raw word
    pub fn push_word(&mut self, word: u32) -> Result<()> {
        if self.words.len() >= self.capacity {
            return Err(Error::CommandBufferFull);
        }
        self.words.push(word);
        Ok(())
    }

    /// Append a single method/value pair
    pub fn push_single(&mut self, method: u16, subchannel: u8, value: u32) -> Result<()> {
        self.ensure_space(2 * WORD_SIZE)?;
        self.words.push(method_header(method, subchannel, 1));
        self.words.push(value);
        Ok(())
    }

    /// Append every word of `other`
    pub fn append(&mut self, other: &CommandStream) -> Result<()> {
        self.ensure_space(other.used_bytes())?;
        self.words.extend_from_slice(&other.words);
        Ok(())
    }

    /// Words between two word offsets
    #[inline]
    pub fn words(&self, start: usize, end: usize) -> &[u32] {
        &self.words[start.min(self.words.len())..end.min(self.words.len())]
    }

    /// Every word written so far
    #[inline]
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    /// Drop everything written after word offset `offset`
    pub fn rewind_to(&mut self, offset: usize) {
        self.words.truncate(offset);
    }

    /// Drop everything
    pub fn reset(&mut self) {
        self.words.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_rewind() {
        let mut stream = CommandStream::new(0, GpuAddr::new(0x10_0000), ByteSize::from_bytes(64));
        stream.push_single(0x0110, 0, 0).unwrap();
        let mark = stream.used_words();
        stream.push_single(0x0200, 1, 7).unwrap();
        assert_eq!(stream.used_bytes(), 16);
        assert_eq!(header_method(stream.as_words()[2]), 0x0200);

        stream.rewind_to(mark);
        assert_eq!(stream.used_words(), 2);
        assert_eq!(stream.gpu_cursor().raw(), 0x10_0008);
    }

    #[test]
    fn test_overflow_reports_full() {
        let mut stream = CommandStream::new(0, GpuAddr::new(0), ByteSize::from_bytes(12));
        stream.push_single(0x0100, 0, 1).unwrap();
        assert_eq!(stream.push_single(0x0100, 0, 2), Err(Error::CommandBufferFull));
        stream.push_word(0xdead).unwrap();
        assert_eq!(stream.push_word(0xbeef), Err(Error::CommandBufferFull));
    }

    #[test]
    fn test_append_fragment() {
        let mut fragment = CommandStream::new(1, GpuAddr::new(0), ByteSize::from_bytes(32));
        fragment.push_single(0x0300, 0, 9).unwrap();
        let mut stream = CommandStream::new(0, GpuAddr::new(0), ByteSize::from_bytes(32));
        stream.push_single(0x0100, 0, 1).unwrap();
        stream.append(&fragment).unwrap();
        assert_eq!(stream.used_words(), 4);
        assert_eq!(stream.as_words()[3], 9);
    }
}
