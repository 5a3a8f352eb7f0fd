//! Newline framing for the controller's byte stream.
//!
//! Bytes arrive in arbitrary chunks; [`LineAssembler`] accumulates them and
//! yields each `\n`-terminated line, trimmed, as soon as its terminator has
//! been seen. Empty lines are dropped. Decoding happens per complete line, so
//! a multi-byte UTF-8 sequence split across two reads still decodes cleanly.

use memchr::memchr;
use tracing::warn;

/// Accumulates raw bytes and extracts complete lines.
///
/// Memory is bounded: when more than `limit` bytes are pending after
/// extraction (no newline in sight), the pending bytes are discarded.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    limit: usize,
    overflow_resets: u64,
}

impl LineAssembler {
    /// Create an assembler for a reader using `read_buffer_size`-byte reads.
    ///
    /// Pending data is capped at twice the read buffer size.
    pub fn new(read_buffer_size: usize) -> Self {
        Self::with_limit(read_buffer_size.saturating_mul(2))
    }

    /// Create an assembler with an explicit pending-data cap.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            overflow_resets: 0,
        }
    }

    /// Append a chunk and return every line it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr(b'\n', &self.buffer[start..]) {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > self.limit {
            warn!(
                pending = self.buffer.len(),
                limit = self.limit,
                "Discarding unterminated input"
            );
            self.buffer.clear();
            self.overflow_resets += 1;
        }

        lines
    }

    /// Bytes waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pending-data cap in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// How many times pending data has been discarded for exceeding the cap.
    pub fn overflow_resets(&self) -> u64 {
        self.overflow_resets
    }
}
