//! Inbound message tag assignments.

use serde::{Deserialize, Serialize};

/// Maps inbound tag bytes to the message kinds the decoder understands.
///
/// The defaults are the protocol-4 assignments. Servers have moved tags
/// between revisions before, so every value can be overridden from the
/// configuration file instead of rebuilding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagTable {
    /// World update: consumptions, entity records, destructions.
    pub updates: u8,
    /// Id of the cell owned by this connection.
    pub user_id: u8,
    /// Free-for-all leaderboard.
    pub leaderboard: u8,
    /// World bounds.
    pub board_size: u8,
}

impl Default for TagTable {
    fn default() -> Self {
        Self {
            updates: 16,
            user_id: 32,
            leaderboard: 49,
            board_size: 64,
        }
    }
}

impl TagTable {
    /// Returns false when two message kinds share a tag byte.
    pub fn is_unambiguous(&self) -> bool {
        let tags = [self.updates, self.user_id, self.leaderboard, self.board_size];
        tags.iter()
            .enumerate()
            .all(|(i, tag)| !tags[i + 1..].contains(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unambiguous() {
        assert!(TagTable::default().is_unambiguous());
    }

    #[test]
    fn test_duplicate_tag_detected() {
        let tags = TagTable {
            board_size: 16,
            ..Default::default()
        };
        assert!(!tags.is_unambiguous());
    }
}
