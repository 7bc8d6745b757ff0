//! Server-sent-event framing for streamed MCP responses.
//!
//! Splits an HTTP body into SSE events (`data: …\n\n`) and decodes each
//! event's data as a JSON message. Chunk boundaries may fall anywhere,
//! including inside a UTF-8 sequence.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use super::errors::{McpError, McpResult};

// ─── Frame decoder ───────────────────────────────────────────────────────────

/// Largest event the decoder buffers while waiting for its terminator.
pub const MAX_EVENT_BYTES: usize = 16 * 1024 * 1024;

/// Incremental SSE event splitter.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
    max_event_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event_bytes,
        }
    }

    /// Append raw body bytes. Carriage returns are dropped so `\r\n` framing
    /// splits the same way as `\n`.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Pop the data payload of the next complete event, if one is buffered.
    ///
    /// Events with no `data:` lines (comments, keep-alives) are skipped.
    pub fn next_event(&mut self) -> Option<String> {
        loop {
            // Back up one byte: the terminator may straddle two pushes.
            let from = self.scanned.saturating_sub(1);
            let Some(pos) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                return None;
            };
            let end = from + pos;
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if let Some(data) = event_data(&raw[..end]) {
                return Some(data);
            }
        }
    }

    /// True once the unterminated tail has grown past the event limit.
    pub fn overflowed(&self) -> bool {
        self.buffer.len() > self.max_event_bytes
    }

    /// Flush whatever remains once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let raw = std::mem::take(&mut self.buffer);
        event_data(&raw)
    }
}

/// Join the `data:` lines of one event. Other fields are ignored.
fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = Vec::new();
    for line in text.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    if data.trim().is_empty() {
        None
    } else {
        Some(data)
    }
}

// ─── JSON frame stream ───────────────────────────────────────────────────────

/// Turn a byte stream into a stream of decoded JSON frames.
///
/// A frame whose data is not valid JSON yields a `ProtocolError`; a transport
/// failure yields `ConnectionFailed`. The stream ends with the body.
pub fn json_frames<S, B, E>(server: String, body: S) -> impl Stream<Item = McpResult<Value>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    json_frames_with_limit(server, body, MAX_EVENT_BYTES)
}

/// [`json_frames`] with a custom event size limit. An event that outgrows
/// it yields a `ProtocolError` and ends the stream.
pub fn json_frames_with_limit<S, B, E>(
    server: String,
    body: S,
    max_event_bytes: usize,
) -> impl Stream<Item = McpResult<Value>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (body, FrameDecoder::with_limit(max_event_bytes), server, false),
        move |(mut body, mut decoder, server, mut ended)| async move {
            loop {
                if let Some(data) = decoder.next_event() {
                    let frame = decode(&server, &data);
                    return Some((frame, (body, decoder, server, ended)));
                }
                if ended {
                    return None;
                }
                if decoder.overflowed() {
                    let err = McpError::protocol(
                        &server,
                        format!("event exceeds {max_event_bytes} bytes without a terminator"),
                    );
                    return Some((Err(err), (body, decoder, server, true)));
                }

                match body.next().await {
                    Some(Ok(bytes)) => decoder.push(bytes.as_ref()),
                    Some(Err(e)) => {
                        let err = McpError::ConnectionFailed {
                            server: server.clone(),
                            reason: format!("stream read error: {e}"),
                        };
                        return Some((Err(err), (body, decoder, server, true)));
                    }
                    None => {
                        ended = true;
                        if let Some(data) = decoder.finish() {
                            let frame = decode(&server, &data);
                            return Some((frame, (body, decoder, server, ended)));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

fn decode(server: &str, data: &str) -> McpResult<Value> {
    serde_json::from_str(data)
        .map_err(|e| McpError::protocol(server, format!("malformed event frame: {e}")))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
