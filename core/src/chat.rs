use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    PlayerChat,
    System,
}

/// A single logged line. Entries are immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub kind: ChatKind,
    pub timestamp: DateTime<Utc>,
    /// Only set for player chat
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub text: String,
}

impl ChatLogEntry {
    pub fn player(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::PlayerChat,
            timestamp: Utc::now(),
            sender: Some(sender.into()),
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: ChatKind::System,
            timestamp: Utc::now(),
            sender: None,
            text: text.into(),
        }
    }
}

/// Append-only log bounded by capacity; the oldest entry is evicted on overflow.
#[derive(Debug)]
pub struct ChatLog {
    entries: VecDeque<ChatLogEntry>,
    capacity: usize,
}

impl ChatLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ChatLogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatLogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }
}
