//! Incremental SSE block framing.
//!
//! Upstream providers and the Muse proxy both frame events as
//! `data: <payload>\n\n` blocks, possibly split across network reads. The
//! [`BlockBuffer`] accumulates raw bytes and only yields a block once its
//! `\n\n` terminator has arrived, so a read boundary can never split a
//! multi-byte character or a JSON payload mid-parse.

use std::string::FromUtf8Error;

/// Sentinel payload some providers send to mark the end of a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One parsed SSE block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseBlock {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

impl SseBlock {
    /// True when the payload is the literal `[DONE]` end-of-stream marker.
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Buffers raw bytes and yields complete SSE blocks.
///
/// Bytes are decoded as UTF-8 only once a full block is available; a block
/// that is not valid UTF-8 is reported as an error for that block alone and
/// the buffer keeps framing subsequent blocks.
#[derive(Debug, Default)]
pub struct BlockBuffer {
    buf: Vec<u8>,
}

impl BlockBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete block, if its terminator has arrived.
    ///
    /// Dataless blocks (comments, keep-alive padding, bare `event:` lines)
    /// are consumed and discarded here; `None` always means the buffer
    /// holds no further terminated block.
    pub fn next_block(&mut self) -> Option<Result<SseBlock, FromUtf8Error>> {
        loop {
            let end = find_terminator(&self.buf)?;
            let raw: Vec<u8> = self.buf.drain(..end.block_end).collect();
            self.buf.drain(..end.terminator_len);

            match String::from_utf8(raw) {
                Ok(text) => {
                    if let Some(block) = parse_block(&text) {
                        return Some(Ok(block));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Flush a trailing block that was never terminated.
    ///
    /// Called at end of stream; a well-behaved upstream terminates every
    /// block, but a final event cut off by connection close is still parsed
    /// rather than dropped.
    pub fn finish(&mut self) -> Option<Result<SseBlock, FromUtf8Error>> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        match String::from_utf8(raw) {
            Ok(text) => parse_block(&text).map(Ok),
            Err(e) => Some(Err(e)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

struct Terminator {
    block_end: usize,
    terminator_len: usize,
}

/// Find the first blank-line terminator (`\n\n` or `\r\n\r\n`).
fn find_terminator(buf: &[u8]) -> Option<Terminator> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some(Terminator {
                block_end: i,
                terminator_len: 2,
            });
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some(Terminator {
                block_end: i,
                terminator_len: 4,
            });
        }
    }
    None
}

/// Parse the field lines of one block.
///
/// Returns `None` for blocks carrying no data (comments, bare `event:`
/// lines, keep-alive padding) so callers never see empty payloads.
fn parse_block(text: &str) -> Option<SseBlock> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseBlock {
        event,
        data: data_lines.join("\n"),
    })
}
