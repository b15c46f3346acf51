//! Inbound frame decoding.

use bytes::Bytes;

use crate::error::CodecError;
use crate::message::{Consumption, DecodedMessage, Entity};
use crate::reader::FrameReader;
use crate::tags::TagTable;

/// Minimum frame length for a world update: tag, zero consumptions, the
/// entity sentinel and zero destructions.
pub const MIN_UPDATES_LEN: usize = 1 + 2 + 4 + 4;
/// Tag plus a `u32` id.
pub const MIN_USER_ID_LEN: usize = 1 + 4;
/// Tag plus four `f64` bounds.
pub const MIN_BOARD_SIZE_LEN: usize = 1 + 4 * 8;
/// Tag plus a `u32` entry count.
pub const MIN_LEADERBOARD_LEN: usize = 1 + 4;

// Flag bits that are followed by padding on the wire.
const PAD_4: u8 = 0x02;
const PAD_8: u8 = 0x04;
const PAD_16: u8 = 0x08;

/// Decodes one inbound frame.
///
/// # Arguments
///
/// * `tags` - Tag assignments for the protocol revision in use
/// * `frame` - The complete frame, tag byte included
///
/// # Returns
///
/// The typed message. Unrecognized tags yield [`DecodedMessage::Unknown`]
/// carrying the whole frame.
///
/// # Errors
///
/// [`CodecError::Framing`] when the frame is empty or shorter than its tag
/// requires. Trailing bytes after a complete message are ignored.
pub fn decode_frame(tags: &TagTable, frame: &[u8]) -> Result<DecodedMessage, CodecError> {
    let Some(&tag) = frame.first() else {
        return Err(CodecError::Framing {
            tag: 0,
            needed: 1,
            available: 0,
        });
    };

    let mut reader = FrameReader::new(tag, frame);

    if tag == tags.user_id {
        reader.require(MIN_USER_ID_LEN - 1)?;
        Ok(DecodedMessage::UserId { id: reader.u32()? })
    } else if tag == tags.updates {
        reader.require(MIN_UPDATES_LEN - 1)?;
        decode_updates(&mut reader)
    } else if tag == tags.board_size {
        reader.require(MIN_BOARD_SIZE_LEN - 1)?;
        Ok(DecodedMessage::BoardSize {
            min_x: reader.f64()?,
            min_y: reader.f64()?,
            max_x: reader.f64()?,
            max_y: reader.f64()?,
        })
    } else if tag == tags.leaderboard {
        reader.require(MIN_LEADERBOARD_LEN - 1)?;
        let count = reader.u32()?;
        Ok(DecodedMessage::Leaderboard {
            count,
            payload: Bytes::copy_from_slice(&frame[reader.position()..]),
        })
    } else {
        Ok(DecodedMessage::Unknown {
            tag,
            raw: Bytes::copy_from_slice(frame),
        })
    }
}

fn decode_updates(reader: &mut FrameReader<'_>) -> Result<DecodedMessage, CodecError> {
    let consumption_count = reader.u16()? as usize;
    reader.require(consumption_count * 8)?;
    let mut consumptions = Vec::with_capacity(consumption_count);
    for _ in 0..consumption_count {
        consumptions.push(Consumption {
            consumer_id: reader.u32()?,
            consumed_id: reader.u32()?,
        });
    }

    let mut entities = Vec::new();
    loop {
        let id = reader.u32()?;
        if id == 0 {
            break;
        }
        entities.push(decode_entity(reader, id)?);
    }

    let destruction_count = reader.u32()? as usize;
    reader.require(destruction_count.saturating_mul(4))?;
    let mut destructions = Vec::with_capacity(destruction_count);
    for _ in 0..destruction_count {
        destructions.push(reader.u32()?);
    }

    Ok(DecodedMessage::Updates {
        consumptions,
        entities,
        destructions,
    })
}

fn decode_entity(reader: &mut FrameReader<'_>, id: u32) -> Result<Entity, CodecError> {
    let x = reader.i32()?;
    let y = reader.i32()?;
    let size = reader.i16()?;
    let (r, g, b) = (reader.u8()?, reader.u8()?, reader.u8()?);
    let flags = reader.u8()?;

    if flags & PAD_4 != 0 {
        reader.skip(4)?;
    }
    if flags & PAD_8 != 0 {
        reader.skip(8)?;
    }
    if flags & PAD_16 != 0 {
        reader.skip(16)?;
    }

    Ok(Entity {
        id,
        x,
        y,
        size,
        color: format!("#{r:02x}{g:02x}{b:02x}"),
        name: reader.utf16_zstring()?,
        flags,
    })
}

/// Number of padding bytes that follow an entity's flag byte.
pub(crate) fn padding_for(flags: u8) -> usize {
    let mut padding = 0;
    if flags & PAD_4 != 0 {
        padding += 4;
    }
    if flags & PAD_8 != 0 {
        padding += 8;
    }
    if flags & PAD_16 != 0 {
        padding += 16;
    }
    padding
}
