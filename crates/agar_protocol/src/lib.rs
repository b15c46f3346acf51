//! # Agar Protocol - Wire Codec for the Upstream Game Protocol
//!
//! Pure encode/decode logic for the binary protocol spoken by the upstream
//! game servers. Nothing in this crate performs I/O; every function works on
//! in-memory buffers so it can be driven from any transport.
//!
//! ## Outbound
//!
//! Right after the transport opens, a client sends three frames:
//!
//! | Tag   | Body                         |
//! |-------|------------------------------|
//! | `254` | protocol version, `u32` LE   |
//! | `255` | connection key, `u32` LE     |
//! | `80`  | join code, one byte per char |
//!
//! See [`encode_handshake`].
//!
//! ## Inbound
//!
//! Every inbound frame starts with a tag byte. [`decode_frame`] dispatches on
//! that byte through a [`TagTable`] and produces a [`DecodedMessage`]. Tags
//! the table does not know about decode to [`DecodedMessage::Unknown`]; only
//! truncated frames are errors.
//!
//! ```rust
//! use agar_protocol::{decode_frame, DecodedMessage, TagTable};
//!
//! let tags = TagTable::default();
//! let frame = [tags.user_id, 7, 0, 0, 0];
//! let message = decode_frame(&tags, &frame[..]).unwrap();
//! assert_eq!(message, DecodedMessage::UserId { id: 7 });
//! ```

pub mod decode;
pub mod encode;
pub mod error;
pub mod handshake;
pub mod message;
pub mod tags;

mod reader;

pub use decode::decode_frame;
pub use encode::{encode_board_size, encode_leaderboard, encode_updates, encode_user_id};
pub use error::CodecError;
pub use handshake::{encode_handshake, HandshakeParams, DEFAULT_KEY, PROTOCOL_VERSION};
pub use message::{Consumption, DecodedMessage, Entity};
pub use tags::TagTable;

use bytes::Bytes;

/// Codec bound to one tag table and one set of handshake parameters.
///
/// Upstream connections hold one of these so that every connection in a pool
/// speaks the same protocol revision.
#[derive(Debug, Clone, Default)]
pub struct ProtocolCodec {
    tags: TagTable,
    handshake: HandshakeParams,
}

impl ProtocolCodec {
    pub fn new(tags: TagTable, handshake: HandshakeParams) -> Self {
        Self { tags, handshake }
    }

    /// The three handshake frames for `join_code`, in send order.
    pub fn handshake_frames(&self, join_code: &str) -> Result<[Bytes; 3], CodecError> {
        encode_handshake(&self.handshake, join_code)
    }

    /// Decodes one inbound frame.
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedMessage, CodecError> {
        decode_frame(&self.tags, frame)
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    pub fn handshake(&self) -> &HandshakeParams {
        &self.handshake
    }
}
