use std::fmt;
use std::str::FromStr;

use bytes::{Buf, Bytes, BytesMut};

pub const DONE_MARKER: &str = "[DONE]";

// ============================================================================
// SSE EVENT CONTAINER
// ============================================================================

/// A single `data:` line of a Server-Sent Events stream
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Payload after the `data:` prefix
    pub data: String,
    /// Line as received, without the trailing newline
    pub raw_line: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            raw_line: format!("data: {}", data),
            data,
        }
    }

    pub fn done() -> Self {
        Self::data(DONE_MARKER)
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    /// Wire encoding including the blank separator line
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\n\n", self.raw_line).into_bytes()
    }
}

impl FromStr for SseEvent {
    type Err = SseParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let Some(rest) = line.strip_prefix("data:") else {
            return Err(SseParseError {
                message: format!("line does not start with 'data:': {}", line),
            });
        };
        let data = rest.strip_prefix(' ').unwrap_or(rest);
        if data.is_empty() {
            return Err(SseParseError {
                message: "empty data field is not a valid SSE event".to_string(),
            });
        }
        Ok(SseEvent {
            data: data.to_string(),
            raw_line: line.to_string(),
        })
    }
}

impl fmt::Display for SseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw_line)
    }
}

#[derive(Debug)]
pub struct SseParseError {
    pub message: String,
}

impl fmt::Display for SseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SSE parse error: {}", self.message)
    }
}

impl std::error::Error for SseParseError {}

// ============================================================================
// LINE BUFFER
// ============================================================================

/// One complete line drained from an [`SseLineBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Text(String),
    /// Not valid UTF-8; kept byte for byte, newline stripped
    Raw(Bytes),
}

impl SseLine {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SseLine::Text(line) => Some(line),
            SseLine::Raw(_) => None,
        }
    }
}

/// Reassembles complete lines from arbitrarily split network chunks.
///
/// Bytes are held until a `\n` arrives, so multi-byte characters split across
/// chunks are never decoded early. A trailing `\r` is stripped from each line.
/// Each line is decoded on its own; one bad line never costs its neighbours.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: BytesMut,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(newline).freeze();
            self.pending.advance(1);
            lines.push(decode_line(line));
        }
        lines
    }

    /// Drain whatever is left once the upstream body ends
    pub fn finish(&mut self) -> Option<SseLine> {
        if self.pending.is_empty() {
            return None;
        }
        Some(decode_line(self.pending.split().freeze()))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn decode_line(bytes: Bytes) -> SseLine {
    match std::str::from_utf8(&bytes) {
        Ok(line) => SseLine::Text(line.strip_suffix('\r').unwrap_or(line).to_string()),
        Err(_) => SseLine::Raw(bytes),
    }
}

// ============================================================================
// SIGNATURE SCAN
// ============================================================================

const SIGNATURE_KEY: &str = "\"thoughtSignature\"";

/// Find the first non-empty `thoughtSignature` value in a raw JSON event
/// without deserializing it.
pub fn scan_signature(data: &str) -> Option<String> {
    let mut search_from = 0;
    while let Some(offset) = data[search_from..].find(SIGNATURE_KEY) {
        let after_key = search_from + offset + SIGNATURE_KEY.len();
        search_from = after_key;

        let rest = data[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let Some(value) = rest.trim_start().strip_prefix('"') else {
            continue;
        };
        if let Some(signature) = read_json_string(value) {
            if !signature.is_empty() {
                return Some(signature);
            }
        }
    }
    None
}

// Reads up to the closing quote; signatures are base64 so escapes are rare
fn read_json_string(input: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'u' => {
                    let code: String = chars.by_ref().take(4).collect();
                    let value = u32::from_str_radix(&code, 16).ok()?;
                    out.push(char::from_u32(value)?);
                }
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
    None
}
