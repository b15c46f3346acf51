//! Server-side frame encoding.
//!
//! The relay never sends these frames upstream. They exist so tests and
//! loopback servers can produce byte-exact inbound traffic.

use bytes::{BufMut, Bytes, BytesMut};

use crate::decode::padding_for;
use crate::error::CodecError;
use crate::message::{Consumption, Entity};
use crate::tags::TagTable;

pub fn encode_user_id(tags: &TagTable, id: u32) -> Bytes {
    let mut frame = BytesMut::with_capacity(5);
    frame.put_u8(tags.user_id);
    frame.put_u32_le(id);
    frame.freeze()
}

pub fn encode_board_size(tags: &TagTable, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Bytes {
    let mut frame = BytesMut::with_capacity(33);
    frame.put_u8(tags.board_size);
    for bound in [min_x, min_y, max_x, max_y] {
        frame.put_f64_le(bound);
    }
    frame.freeze()
}

pub fn encode_leaderboard(tags: &TagTable, count: u32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + payload.len());
    frame.put_u8(tags.leaderboard);
    frame.put_u32_le(count);
    frame.put_slice(payload);
    frame.freeze()
}

/// Encodes a world update.
///
/// Padding selected by each entity's flags is written as zeros so the frame
/// decodes back to the same entities.
///
/// # Errors
///
/// [`CodecError::InvalidColor`] if an entity color is not `#rrggbb`.
pub fn encode_updates(
    tags: &TagTable,
    consumptions: &[Consumption],
    entities: &[Entity],
    destructions: &[u32],
) -> Result<Bytes, CodecError> {
    let mut frame = BytesMut::new();
    frame.put_u8(tags.updates);

    frame.put_u16_le(consumptions.len() as u16);
    for consumption in consumptions {
        frame.put_u32_le(consumption.consumer_id);
        frame.put_u32_le(consumption.consumed_id);
    }

    for entity in entities {
        let [r, g, b] = parse_color(&entity.color)?;
        frame.put_u32_le(entity.id);
        frame.put_i32_le(entity.x);
        frame.put_i32_le(entity.y);
        frame.put_i16_le(entity.size);
        frame.put_slice(&[r, g, b, entity.flags]);
        frame.put_bytes(0, padding_for(entity.flags));
        for unit in entity.name.encode_utf16() {
            frame.put_u16_le(unit);
        }
        frame.put_u16_le(0);
    }
    frame.put_u32_le(0);

    frame.put_u32_le(destructions.len() as u32);
    for id in destructions {
        frame.put_u32_le(*id);
    }

    Ok(frame.freeze())
}

fn parse_color(color: &str) -> Result<[u8; 3], CodecError> {
    let hex = color
        .strip_prefix('#')
        .filter(|hex| hex.len() == 6)
        .ok_or_else(|| CodecError::InvalidColor(color.to_string()))?;
    let rgb = u32::from_str_radix(hex, 16).map_err(|_| CodecError::InvalidColor(color.to_string()))?;
    let [_, r, g, b] = rgb.to_be_bytes();
    Ok([r, g, b])
}
