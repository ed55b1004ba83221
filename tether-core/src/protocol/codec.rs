//! Newline-delimited JSON frame codec.
//!
//! Frames are UTF-8 JSON values separated by a single `\n` (0x0A). Encoded
//! JSON contains no raw newlines outside string literals (where `\n` is the
//! two-character escape), so no further escaping is needed.
//!
//! The decoder reassembles frames from arbitrary chunk boundaries. Framing
//! is advisory: unparseable lines are dropped silently, and a reassembly
//! buffer that outgrows [`MAX_BUFFER_BYTES`] is discarded wholesale rather
//! than scanned for the next separator.

use bytes::BytesMut;
use thiserror::Error;
use tracing::debug;

use super::Message;

/// Upper bound on buffered, not-yet-terminated inbound bytes.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    /// The reassembly buffer exceeded [`MAX_BUFFER_BYTES`]. All buffered
    /// bytes have been discarded; no resynchronization is attempted.
    #[error("reassembly buffer exceeded {MAX_BUFFER_BYTES} bytes; discarded")]
    BufferOverflow,
}

/// Serialize a message and append the frame separator.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Stateful frame reassembler for one peer session.
///
/// Not restartable across sessions; a new session creates a fresh decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Feed a chunk of inbound bytes; returns the JSON values completed by it.
    ///
    /// Delivery order equals arrival order. Empty lines are skipped and
    /// unparseable lines dropped silently (validation is a separate stage).
    pub fn write(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>, FrameDecodeError> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_BUFFER_BYTES {
            self.buf.clear();
            return Err(FrameDecodeError::BufferOverflow);
        }

        let mut values = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let line = &line[..pos];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<serde_json::Value>(line) {
                Ok(value) => values.push(value),
                Err(e) => debug!(error = %e, line_len = line.len(), "dropping unparseable line"),
            }
        }
        Ok(values)
    }

    /// Bytes currently held awaiting a frame separator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
