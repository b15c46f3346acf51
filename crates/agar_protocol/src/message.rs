//! Typed messages produced by the decoder.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One consumption reported in a world update.
///
/// The upstream only sends two ids; which one did the eating is inferred from
/// observed traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumption {
    pub consumer_id: u32,
    pub consumed_id: u32,
}

/// A cell, pellet or virus as described by a world update record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u32,
    pub x: i32,
    pub y: i32,
    /// Radius in world units.
    pub size: i16,
    /// `#rrggbb`, lowercase hex.
    pub color: String,
    pub name: String,
    /// Raw flag byte. Bits 1-3 select padding on the wire; the rest is
    /// passed through without interpretation.
    pub flags: u8,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedMessage {
    /// Id of the cell controlled by this connection.
    UserId { id: u32 },

    /// World update.
    Updates {
        consumptions: Vec<Consumption>,
        entities: Vec<Entity>,
        destructions: Vec<u32>,
    },

    /// World bounds in game units.
    BoardSize {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },

    /// Leaderboard entries, not structurally decoded.
    Leaderboard { count: u32, payload: Bytes },

    /// Any tag the decoder does not know. `raw` is the whole frame.
    Unknown { tag: u8, raw: Bytes },
}

impl DecodedMessage {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedMessage::UserId { .. } => "user_id",
            DecodedMessage::Updates { .. } => "updates",
            DecodedMessage::BoardSize { .. } => "board_size",
            DecodedMessage::Leaderboard { .. } => "leaderboard",
            DecodedMessage::Unknown { .. } => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DecodedMessage::Unknown { .. })
    }
}
