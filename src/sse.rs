//! Incremental decoder for `event:` / `data:` framed Server-Sent-Events.
//!
//! Bytes arrive in arbitrary chunks. Complete lines are consumed as soon as
//! their newline is seen; a trailing partial line waits for the next chunk,
//! up to [`MAX_LINE_BYTES`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The most recent `event:` field, if any was sent for this event.
    pub event: Option<String>,
    /// One `data:` line. Each line is decoded on its own.
    pub data: String,
}

/// Longest line the decoder will buffer while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream line exceeds {limit} bytes without a newline")]
pub struct LineTooLong {
    pub limit: usize,
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    event: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: MAX_LINE_BYTES,
            event: None,
        }
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, LineTooLong> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let end = cursor + offset;
            if let Some(frame) = self.consume_line(&buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            cursor = start;
        }

        buffer.drain(..start);
        self.scanned = buffer.len();
        self.buffer = buffer;

        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            self.scanned = 0;
            return Err(LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(frames)
    }

    /// Flushes a final line that was not newline terminated.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.consume_line(&line)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn consume_line(&mut self, raw: &[u8]) -> Option<SseFrame> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        if line.is_empty() {
            // blank line ends the current event
            self.event = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        match field {
            "event" => {
                self.event = Some(value.to_string());
                None
            }
            "data" => Some(SseFrame {
                event: self.event.clone(),
                data: value.to_string(),
            }),
            _ => None,
        }
    }
}
