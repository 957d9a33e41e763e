//! Event stream decoding for `invoke-with-response-stream` responses.
//!
//! Bedrock frames streaming output with the binary AWS event-stream encoding:
//!
//! ```text
//! [total_len:u32][headers_len:u32][prelude_crc:u32][headers][payload][message_crc:u32]
//! ```
//!
//! Frames whose prelude checks out are decoded exactly. Anything else goes
//! through a line-oriented recovery path: each newline-terminated chunk is
//! parsed as JSON, and when that fails the JSON fragments following an
//! `:event-type` marker are cut out of the surrounding bytes. Event payloads of
//! the form `{"bytes": "<base64>"}` or `{"body": "<json>"}` are unwrapped to
//! the inner model chunk in both paths.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use regex::bytes::Regex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{GatewayError, Result};

const PRELUDE_LEN: usize = 12;
const MESSAGE_CRC_LEN: usize = 4;
/// Keeps the high byte of `total_len` at zero, which is how a prelude is told apart from text.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024 - 1;
/// Upper bound on bytes carried between lines while waiting for a fragment to close.
const MAX_CARRY_LEN: usize = 1024 * 1024;

const CONTROL_MARKERS: &[&str] = &[
    ":event-type",
    ":content-type",
    ":message-type",
    ":exception-type",
    "application/json",
];

/// One decoded unit of a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A model chunk, already unwrapped from its `bytes`/`body` envelope.
    Payload(Value),
    /// Printable text recovered from bytes that held no JSON.
    Raw(String),
    /// An `exception` or `error` frame.
    Exception { kind: String, message: String },
}

fn event_type_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?-u):event-type[^{]*\{").expect("event-type marker regex must compile")
    })
}

/// Result of scanning a buffer for marker-prefixed fragments.
#[derive(Debug, Default)]
struct FragmentScan {
    fragments: Vec<Value>,
    /// Offset of a marker whose fragment has not closed yet.
    incomplete: Option<usize>,
    /// End offset of the last complete fragment.
    consumed: usize,
}

/// Index one past the `}` closing the object opened at `open`, if present.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn scan_fragments(bytes: &[u8]) -> FragmentScan {
    let marker = event_type_marker();
    let mut scan = FragmentScan::default();
    let mut pos = 0;
    while let Some(m) = marker.find_at(bytes, pos) {
        let open = m.end() - 1;
        match balanced_end(bytes, open) {
            Some(end) => {
                match serde_json::from_slice::<Value>(&bytes[open..end]) {
                    Ok(value) => scan.fragments.push(value),
                    Err(err) => tracing::debug!("Skipping unparseable event fragment: {}", err),
                }
                scan.consumed = end;
                pos = end;
            }
            None => {
                scan.incomplete = Some(m.start());
                break;
            }
        }
    }
    scan
}

/// Extract every complete JSON object that follows an `:event-type` marker.
pub fn extract_fragments(bytes: &[u8]) -> Vec<Value> {
    scan_fragments(bytes).fragments
}

/// Unwrap `{"bytes": base64}` and `{"body": "<json>"}` envelopes.
fn unwrap_event(value: Value) -> Frame {
    if let Some(encoded) = value.get("bytes").and_then(Value::as_str) {
        match BASE64.decode(encoded) {
            Ok(decoded) => {
                return match serde_json::from_slice::<Value>(&decoded) {
                    Ok(inner) => unwrap_event(inner),
                    Err(_) => Frame::Raw(String::from_utf8_lossy(&decoded).into_owned()),
                };
            }
            Err(err) => tracing::debug!("Event bytes are not valid base64: {}", err),
        }
    }
    if let Some(body) = value.get("body").and_then(Value::as_str) {
        if let Ok(inner) = serde_json::from_str::<Value>(body) {
            return unwrap_event(inner);
        }
    }
    Frame::Payload(value)
}

/// Printable text left once control markers and binary noise are removed.
fn clean_raw_text(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    for marker in CONTROL_MARKERS {
        text = text.replace(marker, "");
    }
    text.chars()
        .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end.max(start)]
}

fn be_u32(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// String-typed headers of one event-stream frame; other value types are skipped.
fn parse_headers(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let truncated = |what: &str| GatewayError::Parse(format!("event-stream header {what} truncated"));
    let mut out = HashMap::new();
    let mut idx = 0usize;
    while idx < bytes.len() {
        let name_len = bytes[idx] as usize;
        idx += 1;
        let name = bytes
            .get(idx..idx + name_len)
            .ok_or_else(|| truncated("name"))?;
        let name = String::from_utf8_lossy(name).into_owned();
        idx += name_len;
        let value_type = *bytes.get(idx).ok_or_else(|| truncated("type"))?;
        idx += 1;

        let fixed = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | 7 => None,
            other => {
                return Err(GatewayError::Parse(format!(
                    "unsupported event-stream header type {other}"
                )))
            }
        };
        match fixed {
            Some(len) => {
                if idx + len > bytes.len() {
                    return Err(truncated("value"));
                }
                idx += len;
            }
            None => {
                let len_bytes = bytes.get(idx..idx + 2).ok_or_else(|| truncated("length"))?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                idx += 2;
                let value = bytes.get(idx..idx + len).ok_or_else(|| truncated("value"))?;
                if value_type == 7 {
                    out.insert(name, String::from_utf8_lossy(value).into_owned());
                }
                idx += len;
            }
        }
    }
    Ok(out)
}

enum Prelude {
    /// A complete frame was consumed from the buffer.
    Frames(Vec<Frame>),
    /// Looks like a frame but more bytes are needed.
    Incomplete,
    NotFramed,
}

/// Incremental decoder; push bytes as they arrive, then call [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    carry: Vec<u8>,
    fallback_hits: usize,
    recovered: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the fragment recovery path ran.
    pub fn fallback_hits(&self) -> usize {
        self.fallback_hits
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.next_framed() {
                Prelude::Frames(decoded) => {
                    frames.extend(decoded);
                    continue;
                }
                Prelude::Incomplete => break,
                Prelude::NotFramed => {}
            }

            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                frames.extend(self.decode_line(&line[..pos]));
                continue;
            }

            frames.extend(self.drain_complete_tail());
            break;
        }
        frames
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        let rest = std::mem::take(&mut self.buffer);
        if self.carry.is_empty() && rest.iter().all(u8::is_ascii_whitespace) {
            return Vec::new();
        }
        let frames = self.decode_line(&rest);
        if !self.carry.is_empty() {
            tracing::warn!(
                "Discarding {} bytes of an unterminated event fragment",
                self.carry.len()
            );
            self.carry.clear();
        }
        frames
    }

    fn next_framed(&mut self) -> Prelude {
        if self.buffer.first() != Some(&0) {
            return Prelude::NotFramed;
        }
        if self.buffer.len() < PRELUDE_LEN {
            return Prelude::Incomplete;
        }
        let total_len = be_u32(&self.buffer[0..4]);
        let headers_len = be_u32(&self.buffer[4..8]);
        let prelude_crc = be_u32(&self.buffer[8..12]) as u32;
        if total_len < PRELUDE_LEN + MESSAGE_CRC_LEN
            || total_len > MAX_FRAME_LEN
            || headers_len > total_len - PRELUDE_LEN - MESSAGE_CRC_LEN
            || crc32fast::hash(&self.buffer[0..8]) != prelude_crc
        {
            return Prelude::NotFramed;
        }
        if self.buffer.len() < total_len {
            return Prelude::Incomplete;
        }

        let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
        let payload_end = total_len - MESSAGE_CRC_LEN;
        let message_crc = be_u32(&frame[payload_end..]) as u32;
        if crc32fast::hash(&frame[..payload_end]) != message_crc {
            tracing::warn!("Event-stream message CRC mismatch; recovering fragments");
            return Prelude::Frames(self.decode_fallback(&frame));
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = match parse_headers(&frame[PRELUDE_LEN..headers_end]) {
            Ok(headers) => headers,
            Err(err) => {
                tracing::warn!("Bad event-stream headers ({}); recovering fragments", err);
                return Prelude::Frames(self.decode_fallback(&frame));
            }
        };
        Prelude::Frames(self.decode_framed(&headers, &frame[headers_end..payload_end]))
    }

    fn decode_framed(&mut self, headers: &HashMap<String, String>, payload: &[u8]) -> Vec<Frame> {
        let message_type = headers
            .get(":message-type")
            .map(String::as_str)
            .unwrap_or("event");

        match message_type {
            "exception" | "error" => {
                let kind = headers
                    .get(":exception-type")
                    .or_else(|| headers.get(":error-code"))
                    .cloned()
                    .unwrap_or_else(|| message_type.to_string());
                let message = serde_json::from_slice::<Value>(payload)
                    .ok()
                    .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                    .or_else(|| headers.get(":error-message").cloned())
                    .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
                vec![Frame::Exception { kind, message }]
            }
            _ if payload.is_empty() => Vec::new(),
            _ => match serde_json::from_slice::<Value>(payload) {
                Ok(value) => vec![unwrap_event(value)],
                Err(_) => self.decode_fallback(payload),
            },
        }
    }

    fn decode_line(&mut self, line: &[u8]) -> Vec<Frame> {
        let mut data = std::mem::take(&mut self.carry);
        if !data.is_empty() {
            data.push(b'\n');
        }
        data.extend_from_slice(line);

        let trimmed = trim_whitespace(&data);
        if trimmed.is_empty() {
            return Vec::new();
        }
        if let Ok(value) = serde_json::from_slice::<Value>(trimmed) {
            return vec![unwrap_event(value)];
        }
        self.decode_fallback(trimmed)
    }

    fn decode_fallback(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.fallback_hits += 1;
        let scan = scan_fragments(bytes);

        if let Some(start) = scan.incomplete {
            if bytes.len() - start <= MAX_CARRY_LEN {
                self.carry = bytes[start..].to_vec();
            } else {
                tracing::warn!("Dropping oversized unterminated event fragment");
            }
        }

        if !scan.fragments.is_empty() {
            self.recovered += scan.fragments.len();
            return scan.fragments.into_iter().map(unwrap_event).collect();
        }
        if scan.incomplete.is_some() {
            return Vec::new();
        }
        // Trailing CRC and prelude bytes between recovered frames.
        if self.recovered > 0 && bytes.len() < PRELUDE_LEN + MESSAGE_CRC_LEN {
            return Vec::new();
        }

        let text = clean_raw_text(bytes);
        if text.is_empty() {
            Vec::new()
        } else {
            vec![Frame::Raw(text)]
        }
    }

    /// Emit fragments already complete in an unterminated buffer.
    fn drain_complete_tail(&mut self) -> Vec<Frame> {
        let scan = scan_fragments(&self.buffer);
        if scan.fragments.is_empty() {
            return Vec::new();
        }
        self.fallback_hits += 1;
        self.recovered += scan.fragments.len();
        self.buffer.drain(..scan.consumed);
        scan.fragments.into_iter().map(unwrap_event).collect()
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Pull-based stream of [`Frame`]s over a response body, with a per-chunk read timeout.
pub struct FrameStream {
    inner: ByteStream,
    decoder: FrameDecoder,
    pending: VecDeque<Frame>,
    chunk_timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
    finished: bool,
}

impl FrameStream {
    pub fn new<S>(bytes: S, chunk_timeout: Duration) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(bytes),
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            chunk_timeout,
            deadline: Box::pin(tokio::time::sleep(chunk_timeout)),
            finished: false,
        }
    }

    pub fn from_response(response: reqwest::Response, chunk_timeout: Duration) -> Self {
        Self::new(response.bytes_stream(), chunk_timeout)
    }
}

impl Stream for FrameStream {
    type Item = Result<Frame>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending.extend(this.decoder.push(&chunk));
                    let next = tokio::time::Instant::now() + this.chunk_timeout;
                    this.deadline.as_mut().reset(next);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::from_reqwest(
                        err,
                        this.chunk_timeout.as_secs(),
                    ))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.pending.extend(this.decoder.finish());
                }
                Poll::Pending => {
                    if this.deadline.as_mut().poll(cx).is_ready() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::Timeout(
                            this.chunk_timeout.as_secs(),
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
