//! Newline framing for the session byte stream.
//!
//! TCP delivers bytes, not messages: one read may carry half a line or
//! several lines. `LineFramer` keeps the unterminated tail buffered across
//! reads and hands back only completed lines.

use tracing::warn;

/// Splits a byte stream on `\n`.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Dropping the remainder of an oversized line
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed one read's worth of bytes; returns every line it completed, in
    /// order, trimmed of surrounding whitespace. Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(head);
            let line = String::from_utf8_lossy(&self.buf).trim().to_string();
            self.buf.clear();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > self.max_line_bytes {
                warn!(
                    buffered = self.buf.len(),
                    limit = self.max_line_bytes,
                    "Line exceeds limit, discarding until next newline"
                );
                self.buf.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Bytes held for an unterminated line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}
