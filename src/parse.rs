//! Framing for the inbound byte stream.
//!
//! The BLE link delivers notification-sized chunks, not messages. A chunk may
//! carry several frames back to back, or end in the middle of one (a `Debug`
//! frame can be longer than a notification). [`FrameAccumulator`] buffers the
//! chunks and hands out one [`IncomingMessage`] at a time.
//!
//! | Decoder result | Action |
//! |---|---|
//! | message | consume exactly its bytes, yield it |
//! | `Truncated` | keep the bytes, wait for the next chunk |
//! | `UnknownTag` | drop that single byte, yield the error, resync on the next byte |
//!
//! An unknown tag is never retried: once the cursor is known to be out of
//! step, the only safe move is forward by one byte.

use log::debug;

use crate::error::DecodeError;
use crate::protocol::{decode, IncomingMessage};

/// Incrementally reassembles device → host frames.
///
/// ```
/// # use eyedrops_rs::parse::FrameAccumulator;
/// # use eyedrops_rs::protocol::IncomingMessage;
/// let mut acc = FrameAccumulator::new();
/// acc.push(&[0x02, 0x00, 0x00]);            // CalibrationData, cut short
/// assert!(acc.next_message().is_none());
/// acc.push(&[0x80, 0x3f, 0x01]);            // …rest of it, then a blink
/// assert_eq!(acc.next_message(), Some(Ok(IncomingMessage::CalibrationData(1.0))));
/// assert_eq!(acc.next_message(), Some(Ok(IncomingMessage::BlinkDetected)));
/// assert!(acc.next_message().is_none());
/// ```
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    /// Bytes dropped while resynchronising, for diagnostics.
    skipped: u64,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete frame off the front of the buffer.
    ///
    /// Returns `None` when the buffer is empty or only holds the start of a
    /// frame. A `Some(Err(_))` has already dropped the offending byte, so
    /// calling again continues with the following data.
    pub fn next_message(&mut self) -> Option<Result<IncomingMessage, DecodeError>> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut cursor = self.buffer.as_slice();
        match decode(&mut cursor) {
            Ok(msg) => {
                let used = self.buffer.len() - cursor.len();
                self.buffer.drain(..used);
                Some(Ok(msg))
            }
            Err(DecodeError::Truncated { needed, available }) => {
                debug!("frame incomplete ({available}/{needed} bytes), waiting for more");
                None
            }
            Err(err @ DecodeError::UnknownTag(_)) => {
                self.buffer.remove(0);
                self.skipped += 1;
                Some(Err(err))
            }
        }
    }

    /// Total bytes dropped while resynchronising since creation.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Forget any partial frame, e.g. after the link dropped.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
impl FrameAccumulator {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Result<IncomingMessage, DecodeError>> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_message()).collect()
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}
