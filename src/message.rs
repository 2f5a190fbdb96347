//! Multipart messages.
//!
//! The event bus, the per-module control endpoints and the remote control
//! protocol all exchange the same shape of data: an ordered list of opaque
//! byte frames. [`Message`] is that list, with helpers to push and pop the
//! scalar encodings the protocol uses (UTF-8 strings, single-byte flags and
//! big-endian `u64`s) and a flat byte encoding for the network transport.

use std::collections::VecDeque;

/// Upper bound on the number of frames a decoded message may carry.
const MAX_PARTS: usize = 4096;

/// Errors raised while reading frames out of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The message ran out of frames.
    #[error("message has no more frames")]
    MissingPart,

    /// A frame expected to hold text was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// A fixed-size frame had the wrong length.
    #[error("frame has {got} bytes, expected {expected}")]
    InvalidLength {
        /// Expected frame length.
        expected: usize,
        /// Actual frame length.
        got: usize,
    },

    /// The flat encoding ended before all declared frames were read.
    #[error("encoded message is truncated")]
    Truncated,

    /// The flat encoding declares more frames than allowed.
    #[error("encoded message declares {0} frames")]
    TooManyParts(usize),
}

/// An ordered list of frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    parts: VecDeque<Vec<u8>>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a message from an iterator of frames.
    pub fn from_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a frame, builder style.
    #[must_use]
    pub fn with(mut self, part: impl Into<Vec<u8>>) -> Self {
        self.push(part);
        self
    }

    /// Append a frame.
    pub fn push(&mut self, part: impl Into<Vec<u8>>) {
        self.parts.push_back(part.into());
    }

    /// Append a single-byte frame.
    pub fn push_u8(&mut self, value: u8) {
        self.parts.push_back(vec![value]);
    }

    /// Append a boolean as a single-byte frame (`0` or `1`).
    pub fn push_bool(&mut self, value: bool) {
        self.push_u8(u8::from(value));
    }

    /// Append a big-endian `u64` frame.
    pub fn push_u64(&mut self, value: u64) {
        self.parts.push_back(value.to_be_bytes().to_vec());
    }

    /// Number of frames left in the message.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the message has no frames left.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Borrow the frame at `index` without consuming it.
    pub fn part(&self, index: usize) -> Option<&[u8]> {
        self.parts.get(index).map(Vec::as_slice)
    }

    /// Borrow the frame at `index` as text, if it is valid UTF-8.
    pub fn str_at(&self, index: usize) -> Option<&str> {
        self.part(index).and_then(|p| std::str::from_utf8(p).ok())
    }

    /// Iterate over the remaining frames.
    pub fn parts(&self) -> impl Iterator<Item = &[u8]> {
        self.parts.iter().map(Vec::as_slice)
    }

    /// Remove and return the first frame.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        self.parts.pop_front()
    }

    /// Remove the first frame and decode it as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::MissingPart`] when the message is empty and
    /// [`MessageError::InvalidUtf8`] when the frame is not text.
    pub fn pop_string(&mut self) -> Result<String, MessageError> {
        let part = self.parts.pop_front().ok_or(MessageError::MissingPart)?;
        String::from_utf8(part).map_err(|_| MessageError::InvalidUtf8)
    }

    /// Remove the first frame and decode it as a single byte.
    ///
    /// # Errors
    ///
    /// Returns an error when the message is empty or the frame is not one
    /// byte long.
    pub fn pop_u8(&mut self) -> Result<u8, MessageError> {
        let part = self.parts.pop_front().ok_or(MessageError::MissingPart)?;
        match part.as_slice() {
            [b] => Ok(*b),
            other => Err(MessageError::InvalidLength {
                expected: 1,
                got: other.len(),
            }),
        }
    }

    /// Remove the first frame and decode it as a boolean (non-zero is true).
    ///
    /// # Errors
    ///
    /// Same as [`Message::pop_u8`].
    pub fn pop_bool(&mut self) -> Result<bool, MessageError> {
        self.pop_u8().map(|b| b != 0)
    }

    /// Remove the first frame and decode it as a big-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error when the message is empty or the frame is not eight
    /// bytes long.
    pub fn pop_u64(&mut self) -> Result<u64, MessageError> {
        let part = self.parts.pop_front().ok_or(MessageError::MissingPart)?;
        let bytes: [u8; 8] =
            part.as_slice()
                .try_into()
                .map_err(|_| MessageError::InvalidLength {
                    expected: 8,
                    got: part.len(),
                })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Flatten the message: frame count, then length-prefixed frames, all
    /// lengths as big-endian `u32`.
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self.parts.iter().map(|p| p.len().saturating_add(4)).sum();
        let mut out = Vec::with_capacity(body.saturating_add(4));
        out.extend_from_slice(&len_u32(self.parts.len()).to_be_bytes());
        for part in &self.parts {
            out.extend_from_slice(&len_u32(part.len()).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    /// Parse the flat encoding produced by [`Message::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Truncated`] on short input and
    /// [`MessageError::TooManyParts`] when the declared frame count exceeds
    /// the decoder limit.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut cursor = bytes;
        let count = usize::try_from(read_u32(&mut cursor)?).unwrap_or(usize::MAX);
        if count > MAX_PARTS {
            return Err(MessageError::TooManyParts(count));
        }

        let mut parts = VecDeque::with_capacity(count);
        for _ in 0..count {
            let len = usize::try_from(read_u32(&mut cursor)?).unwrap_or(usize::MAX);
            if cursor.len() < len {
                return Err(MessageError::Truncated);
            }
            let (part, rest) = cursor.split_at(len);
            parts.push_back(part.to_vec());
            cursor = rest;
        }
        if !cursor.is_empty() {
            return Err(MessageError::Truncated);
        }
        Ok(Self { parts })
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, MessageError> {
    if cursor.len() < 4 {
        return Err(MessageError::Truncated);
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    let bytes: [u8; 4] = head.try_into().map_err(|_| MessageError::Truncated)?;
    Ok(u32::from_be_bytes(bytes))
}
