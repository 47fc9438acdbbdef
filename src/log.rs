use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::Direction;

/// Number of entries kept in the message log
pub const MAX_LOG_ENTRIES: usize = 20;

/// One directional turn in the conversation with the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    /// Who produced the text
    pub direction: Direction,
    /// Accumulated text of this turn
    pub text: String,
}

/// Bounded, turn-based message log
///
/// Consecutive appends in the same direction extend the current entry, so a reply
/// split across several notifications reads as one block. A change of direction
/// opens a new entry; beyond [`MAX_LOG_ENTRIES`] the oldest entry is evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLog {
    entries: VecDeque<MessageLogEntry>,
}

impl MessageLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text in the given direction
    pub fn append(&mut self, direction: Direction, text: &str) {
        if let Some(current) = self.entries.back_mut() {
            if current.direction == direction {
                current.text.push_str(text);
                return;
            }
        }

        if self.entries.len() == MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(MessageLogEntry {
            direction,
            text: text.to_string(),
        });
    }

    /// Direction of the most recent entry
    #[must_use]
    pub fn current_direction(&self) -> Option<Direction> {
        self.entries.back().map(|entry| entry.direction)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &MessageLogEntry> {
        self.entries.iter()
    }

    /// Copy of the entries, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<MessageLogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
