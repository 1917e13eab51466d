//! Receive buffer for accumulating a response until it terminates.
//!
//! Uses `bytes::BytesMut` so the finished response is handed out with
//! `freeze()` instead of a copy.
//!
//! A response is terminated when its text contains, case-insensitively,
//! either `"<pattern> <message>"` or the bare `<pattern>` for any configured
//! pattern. Bytes that are not (yet) valid UTF-8 are never matched, so a
//! multi-byte character split across two reads just waits for the next one.
//!
//! # Example
//!
//! ```
//! use linewire_client::ReceiveBuffer;
//!
//! let patterns = vec!["DONE".to_string()];
//! let mut buffer = ReceiveBuffer::new(&patterns, "PING", true);
//!
//! buffer.push(b"PONG 1\n");
//! assert!(!buffer.is_terminated());
//!
//! buffer.push(b"done PING\n");
//! assert!(buffer.is_terminated());
//! ```

use bytes::{Bytes, BytesMut};

/// Initial capacity of the accumulated response.
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Bytes received for the current operation plus its termination needles.
///
/// The lowercased text is kept alongside the raw bytes and extended as
/// chunks arrive, so each push only searches the new text plus enough of
/// the old to catch a needle straddling the boundary.
#[derive(Debug)]
pub struct ReceiveBuffer {
    /// Accumulated bytes for this operation only.
    buffer: BytesMut,
    /// Lowercased text of `buffer[..decoded]`.
    lowered: String,
    decoded: usize,
    /// An invalid UTF-8 sequence arrived; the text can never match.
    invalid: bool,
    matched: bool,
    /// Lowercased strings whose presence ends the response.
    needles: Vec<String>,
    /// Byte length of the longest needle.
    longest: usize,
}

impl ReceiveBuffer {
    /// Create a buffer for one operation.
    ///
    /// `message` is the request text (without line terminator). When
    /// `match_bare_pattern` is false only `"<pattern> <message>"` matches.
    pub fn new(patterns: &[String], message: &str, match_bare_pattern: bool) -> Self {
        let mut needles = Vec::with_capacity(patterns.len() * 2);
        for pattern in patterns {
            needles.push(format!("{} {}", pattern, message).to_lowercase());
            if match_bare_pattern {
                needles.push(pattern.to_lowercase());
            }
        }
        let longest = needles.iter().map(String::len).max().unwrap_or(0);

        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            lowered: String::new(),
            decoded: 0,
            invalid: false,
            matched: false,
            needles,
            longest,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.invalid || self.needles.is_empty() {
            return;
        }

        let tail = &self.buffer[self.decoded..];
        let text = match std::str::from_utf8(tail) {
            Ok(text) => text,
            Err(e) if e.error_len().is_some() => {
                self.invalid = true;
                return;
            }
            // Incomplete sequence at the end: take what decodes now.
            Err(e) => match std::str::from_utf8(&tail[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return,
            },
        };
        let consumed = text.len();
        let searched = self.lowered.len();
        self.lowered.push_str(&text.to_lowercase());
        self.decoded += consumed;

        if !self.matched {
            let mut start = searched.saturating_sub(self.longest.saturating_sub(1));
            while !self.lowered.is_char_boundary(start) {
                start -= 1;
            }
            let window = &self.lowered[start..];
            self.matched = self.needles.iter().any(|needle| window.contains(needle.as_str()));
        }
    }

    /// Whether the accumulated text contains any termination needle.
    ///
    /// Returns `false` while the buffer is not valid UTF-8.
    pub fn is_terminated(&self) -> bool {
        self.matched && !self.invalid && self.decoded == self.buffer.len()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Consume the buffer and return the accumulated response.
    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}
