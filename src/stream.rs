use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use serde_json::Value;

use crate::error::BridgeError;
use crate::http::HttpBodyStream;
use crate::provider::Framing;

/// Classification of a single raw body line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// Framing metadata, comments, blank lines or noise.
    Skip,
    /// JSON payload text to decode.
    Payload(&'a str),
    /// The SSE `[DONE]` sentinel; nothing after it is read.
    Terminate,
}

/// Classifies one line according to the target's framing.
///
/// # Examples
///
/// ```
/// use chat_bridge::provider::Framing;
/// use chat_bridge::stream::{LineKind, classify_line};
///
/// assert_eq!(classify_line(Framing::Sse, "data: {\"a\":1}"), LineKind::Payload("{\"a\":1}"));
/// assert_eq!(classify_line(Framing::Sse, "data: [DONE]"), LineKind::Terminate);
/// assert_eq!(classify_line(Framing::Sse, "event: ping"), LineKind::Skip);
/// ```
pub fn classify_line(framing: Framing, line: &str) -> LineKind<'_> {
    if line.trim().is_empty() {
        return LineKind::Skip;
    }
    match framing {
        Framing::JsonLines => LineKind::Payload(line),
        Framing::Sse => {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if data.trim() == "[DONE]" {
                    LineKind::Terminate
                } else if data.trim_start().starts_with('{') {
                    LineKind::Payload(data)
                } else {
                    LineKind::Skip
                }
            } else if line.starts_with("event:") || line.starts_with(':') {
                LineKind::Skip
            } else if line.starts_with('{') {
                LineKind::Payload(line)
            } else {
                LineKind::Skip
            }
        }
    }
}

/// Turns a streaming response body into decoded JSON frames.
///
/// Bytes are split on `\n` (a trailing `\r` is dropped), each line is classified with
/// [`classify_line`], and payloads are parsed as JSON. A frame that fails to parse is
/// logged and skipped; only transport errors are surfaced, after which the decoder
/// yields nothing more.
pub struct FrameDecoder {
    body: HttpBodyStream,
    framing: Framing,
    buffer: Vec<u8>,
    pending: VecDeque<Value>,
    stream_closed: bool,
    terminated: bool,
    malformed: usize,
}

impl FrameDecoder {
    pub fn new(body: HttpBodyStream, framing: Framing) -> Self {
        Self {
            body,
            framing,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            stream_closed: false,
            terminated: false,
            malformed: 0,
        }
    }

    /// Number of lines dropped because they could not be decoded.
    pub fn malformed_frames(&self) -> usize {
        self.malformed
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        let line = match String::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                self.malformed += 1;
                let err = BridgeError::decode(format!("invalid UTF-8 in stream line: {err}"));
                tracing::warn!(error = %err, "skipping stream line");
                return;
            }
        };
        match classify_line(self.framing, &line) {
            LineKind::Skip => {}
            LineKind::Terminate => {
                self.terminated = true;
                self.buffer.clear();
            }
            LineKind::Payload(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => self.pending.push_back(value),
                Err(err) => {
                    self.malformed += 1;
                    let err = BridgeError::decode(format!("invalid JSON frame: {err}"));
                    tracing::warn!(error = %err, line = %text, "skipping stream frame");
                }
            },
        }
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }
}

impl Stream for FrameDecoder {
    type Item = Result<Value, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.terminated {
                return Poll::Ready(None);
            }

            if this.stream_closed {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                let mut line = std::mem::take(&mut this.buffer);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                this.handle_line(line);
                continue;
            }

            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while !this.terminated {
                        let Some(line) = Self::drain_line(&mut this.buffer) else {
                            break;
                        };
                        this.handle_line(line);
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.terminated = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => this.stream_closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
