//! Binary event-stream frame decoder.
//!
//! The upstream speaks a length-prefixed, CRC-trailed frame protocol with
//! typed headers (AWS event-stream flavor):
//!
//! ```text
//! [u32 total_len BE][u32 headers_len BE][headers][payload][u32 crc32]
//! ```
//!
//! Headers are `[u8 name_len][name][u8 value_type][value]`; the decoder
//! only cares about the `:event-type` string header (type code 7). Corrupt
//! input resynchronizes by dropping one byte at a time; five consecutive
//! resyncs fail the stream.

use serde_json::Value;
use thiserror::Error;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const MIN_FRAME_LEN: usize = 16;
const MAX_CONSECUTIVE_RESYNCS: u32 = 5;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream lost sync: {0} consecutive corrupt bytes")]
    LostSync(u32),
}

/// One successfully decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    consecutive_resyncs: u32,
    /// Total corrupt-byte events seen over the stream's lifetime.
    pub corrupt_events: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete frame now available.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.try_frame() {
                FrameStep::Frame(frame) => {
                    self.consecutive_resyncs = 0;
                    frames.push(frame);
                }
                FrameStep::Skipped => {
                    // Structurally valid frame with an unusable payload.
                    self.consecutive_resyncs = 0;
                }
                FrameStep::NeedMore => break,
                FrameStep::Corrupt => {
                    self.buf.remove(0);
                    self.corrupt_events += 1;
                    self.consecutive_resyncs += 1;
                    if self.consecutive_resyncs >= MAX_CONSECUTIVE_RESYNCS {
                        return Err(DecodeError::LostSync(self.consecutive_resyncs));
                    }
                }
            }
        }

        Ok(frames)
    }

    /// Bytes still sitting in the buffer at end of stream.
    pub fn residual(&self) -> usize {
        self.buf.len()
    }

    fn try_frame(&mut self) -> FrameStep {
        if self.buf.len() < 8 {
            return FrameStep::NeedMore;
        }

        let total_len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        let headers_len = u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;

        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len.saturating_sub(12)
        {
            return FrameStep::Corrupt;
        }
        if self.buf.len() < total_len {
            return FrameStep::NeedMore;
        }

        // CRC32 over everything before the 4-byte trailer.
        let body = &self.buf[..total_len - 4];
        let expected =
            u32::from_be_bytes(self.buf[total_len - 4..total_len].try_into().unwrap());
        if crc32fast::hash(body) != expected {
            return FrameStep::Corrupt;
        }

        let headers = &self.buf[8..8 + headers_len];
        let event_type = match parse_event_type(headers) {
            Some(t) => t,
            None => {
                tracing::debug!("frame without :event-type header, skipping");
                self.buf.drain(..total_len);
                return FrameStep::Skipped;
            }
        };

        let payload = &self.buf[8 + headers_len..total_len - 4];
        let parsed = serde_json::from_slice::<Value>(payload);
        let step = match parsed {
            Ok(payload) => FrameStep::Frame(Frame {
                event_type,
                payload,
            }),
            Err(e) => {
                tracing::warn!(event_type = %event_type, "unparseable frame payload: {}", e);
                self.corrupt_events += 1;
                FrameStep::Skipped
            }
        };
        self.buf.drain(..total_len);
        step
    }
}

enum FrameStep {
    Frame(Frame),
    Skipped,
    NeedMore,
    Corrupt,
}

/// Walk the typed header block and pull out `:event-type`.
fn parse_event_type(mut headers: &[u8]) -> Option<String> {
    while !headers.is_empty() {
        let name_len = headers[0] as usize;
        headers = &headers[1..];
        if headers.len() < name_len + 1 {
            return None;
        }
        let name = &headers[..name_len];
        let value_type = headers[name_len];
        headers = &headers[name_len + 1..];

        let value_len = match value_type {
            0 | 1 => 0, // bool true / false, no payload
            2 => 1,
            3 => 2,
            4 => 4,
            5 => 8,
            6 | 7 => {
                // byte array / string: u16 length prefix
                if headers.len() < 2 {
                    return None;
                }
                let len = u16::from_be_bytes([headers[0], headers[1]]) as usize;
                headers = &headers[2..];
                len
            }
            8 => 8,  // timestamp
            9 => 16, // uuid
            _ => return None,
        };

        if headers.len() < value_len {
            return None;
        }
        if name == b":event-type" && value_type == 7 {
            return String::from_utf8(headers[..value_len].to_vec()).ok();
        }
        headers = &headers[value_len..];
    }
    None
}

// ── test support ────────────────────────────────────────────────

/// Encode a frame the way the upstream does. Test-only, but kept here so
/// integration tests can build wire bytes too.
pub fn encode_frame(event_type: &str, payload: &Value) -> Vec<u8> {
    let mut headers = Vec::new();
    headers.push(b":event-type".len() as u8);
    headers.extend_from_slice(b":event-type");
    headers.push(7u8);
    headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    headers.extend_from_slice(event_type.as_bytes());

    let body = serde_json::to_vec(payload).expect("payload serializes");
    let total_len = 8 + headers.len() + body.len() + 4;

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    frame.extend_from_slice(&headers);
    frame.extend_from_slice(&body);
    let crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}
