//! Connection handshake encoding.
//!
//! The handshake is fire-and-forget: the three frames are written as soon as
//! the transport opens and the server starts streaming game frames without
//! acknowledging them.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Tag of the protocol version frame.
pub const VERSION_TAG: u8 = 254;
/// Tag of the connection key frame.
pub const KEY_TAG: u8 = 255;
/// Tag of the join frame carrying the join code.
pub const JOIN_TAG: u8 = 80;

/// Protocol revision announced in the first handshake frame.
pub const PROTOCOL_VERSION: u32 = 4;

/// Key value observed on the upstream service at the time of writing.
///
/// The upstream rotates this value, so it is only a default for
/// [`HandshakeParams::key`].
pub const DEFAULT_KEY: u32 = 673_720_361;

/// Values sent in the first two handshake frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeParams {
    /// Protocol revision, `4` for every server seen so far.
    #[serde(default = "default_version")]
    pub protocol_version: u32,
    /// Rotating connection key.
    #[serde(default = "default_key")]
    pub key: u32,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_key() -> u32 {
    DEFAULT_KEY
}

impl Default for HandshakeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            key: DEFAULT_KEY,
        }
    }
}

impl HandshakeParams {
    pub fn with_key(key: u32) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }
}

/// Encodes the three handshake frames for `join_code`.
///
/// # Arguments
///
/// * `params` - Protocol version and connection key
/// * `join_code` - Game instance token returned by discovery
///
/// # Returns
///
/// The version frame, the key frame and the join frame, in the order they
/// must be sent.
///
/// # Errors
///
/// [`CodecError::NonAsciiJoinCode`] if any character of the join code is
/// outside the ASCII range. Characters are never truncated to a byte.
pub fn encode_handshake(params: &HandshakeParams, join_code: &str) -> Result<[Bytes; 3], CodecError> {
    Ok([
        tagged_u32(VERSION_TAG, params.protocol_version),
        tagged_u32(KEY_TAG, params.key),
        encode_join(join_code)?,
    ])
}

fn tagged_u32(tag: u8, value: u32) -> Bytes {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u8(tag);
    frame.put_u32_le(value);
    frame.freeze()
}

fn encode_join(join_code: &str) -> Result<Bytes, CodecError> {
    let mut frame = BytesMut::with_capacity(1 + join_code.len());
    frame.put_u8(JOIN_TAG);
    for (position, character) in join_code.chars().enumerate() {
        if !character.is_ascii() {
            return Err(CodecError::NonAsciiJoinCode {
                position,
                character,
            });
        }
        frame.put_u8(character as u8);
    }
    Ok(frame.freeze())
}
