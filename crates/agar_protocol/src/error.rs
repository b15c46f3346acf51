//! Error types for the protocol codec.

use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The frame is shorter than its tag (or a count inside it) requires.
    ///
    /// The byte stream is corrupt; the connection that produced it should be
    /// torn down.
    #[error("Truncated frame (tag {tag}): needed {needed} bytes, got {available}")]
    Framing {
        tag: u8,
        needed: usize,
        available: usize,
    },

    /// A join code character does not fit in a single byte.
    #[error("Join code character {character:?} at position {position} is not ASCII")]
    NonAsciiJoinCode { position: usize, character: char },

    /// An entity color is not of the form `#rrggbb`.
    #[error("Invalid entity color: {0}")]
    InvalidColor(String),
}

impl CodecError {
    /// True when the error means the inbound stream can no longer be trusted.
    pub fn is_framing(&self) -> bool {
        matches!(self, CodecError::Framing { .. })
    }
}
