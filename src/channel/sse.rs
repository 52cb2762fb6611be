//! Incremental decoder for the event stream body.
//!
//! Chunks arrive with arbitrary boundaries: a record can be split across
//! several chunks, and one chunk can hold many records. The decoder keeps
//! the unfinished tail in a buffer and only emits complete lines.
//!
//! ```text
//! data: {"type":"new_message","data":{...}}\n     -> Event(new_message)
//! data: {"text":"hello"}\n                         -> Event(message)
//! event: ping\n                                    -> ignored
//! data: [DONE]\n                                   -> EndOfStream
//! ```
//!
//! Decoding is idempotent under re-chunking: feeding the same bytes in any
//! split produces the same records. A line longer than
//! [`STREAM_MAX_RECORD_BYTES`] is dropped whole, however it was chunked.

use bytes::BytesMut;
use serde_json::Value;

use crate::constants::{STREAM_END_SENTINEL, STREAM_MAX_RECORD_BYTES, STREAM_RECORD_PREFIX};
use crate::event::{Event, EventKind};

use super::frame::decode_value;

/// One decoded record from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    /// A recognized event.
    Event(Event),
    /// The server signalled a graceful end of stream.
    EndOfStream,
}

/// Line-buffered stream decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    /// Skipping the rest of an oversize line until its newline arrives.
    discarding: bool,
    dropped: u64,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every record completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
        {
            let pos = self.scanned + offset;
            let line = self.buffer.split_to(pos + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = &line[..pos];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.len() > STREAM_MAX_RECORD_BYTES {
                self.drop_oversize(line.len());
                continue;
            }
            if let Some(record) = self.decode_line(line) {
                records.push(record);
            }
        }
        self.scanned = self.buffer.len();

        if self.discarding {
            self.buffer.clear();
            self.scanned = 0;
        } else if self.buffer.len() > STREAM_MAX_RECORD_BYTES + 1 {
            // One spare byte for a trailing '\r' that the complete line would shed.
            self.drop_oversize(self.buffer.len());
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        records
    }

    /// Discard any partial record. Called when a connection is replaced.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
    }

    /// True if an incomplete record is waiting for more bytes.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Number of malformed or oversize records dropped since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn drop_oversize(&mut self, len: usize) {
        log::warn!(
            "[Stream] Dropping record over {} bytes ({} buffered)",
            STREAM_MAX_RECORD_BYTES,
            len
        );
        self.dropped += 1;
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<StreamRecord> {
        let Ok(line) = std::str::from_utf8(line) else {
            log::warn!("[Stream] Dropping non-UTF-8 record ({} bytes)", line.len());
            self.dropped += 1;
            return None;
        };

        // event:, id:, retry:, comments and blank separators carry nothing we use.
        let payload = line.strip_prefix(STREAM_RECORD_PREFIX)?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == STREAM_END_SENTINEL {
            return Some(StreamRecord::EndOfStream);
        }

        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                log::warn!(
                    "[Stream] Dropping malformed record ({}): {}",
                    e,
                    payload.chars().take(100).collect::<String>()
                );
                self.dropped += 1;
                return None;
            }
        };

        Some(StreamRecord::Event(normalize(value)))
    }
}

/// Socket-shaped payloads with a known kind keep it; anything else is a
/// generic message carrying the whole record.
fn normalize(value: Value) -> Event {
    match decode_value(value.clone()) {
        Ok(Some(event)) => event,
        Ok(None) | Err(_) => Event::new(EventKind::Message, value),
    }
}
