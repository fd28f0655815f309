//! Memory tier data types. Extraction and bounds enforcement live in
//! `wavess_memory::manager`; these are the shapes that get persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::models::Role;

pub const SHORT_TERM_CAPACITY: usize = 5;
pub const MAX_PREFERENCES: usize = 20;
pub const MAX_MILESTONES: usize = 10;
pub const MAX_NICKNAMES: usize = 10;
pub const MAX_DISLIKES: usize = 20;
/// Personal info carries no level tag, so it is only taken from turns at or
/// below this level.
pub const PERSONAL_INFO_MAX_LEVEL: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub role: Role,
    /// At most 100 characters.
    pub summary: String,
    pub emotion: String,
    pub keywords: Vec<String>,
    /// Content level of the source message.
    #[serde(default = "default_level")]
    pub level: u8,
    pub timestamp: DateTime<Utc>,
}

fn default_level() -> u8 {
    1
}

/// Per-chat FIFO ring of summarized turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub chat_id: String,
    pub entries: VecDeque<MessageSummary>,
    pub current_topic: String,
    pub last_updated: DateTime<Utc>,
}

impl ShortTermMemory {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            entries: VecDeque::with_capacity(SHORT_TERM_CAPACITY),
            current_topic: String::new(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub category: String,
    pub content: String,
    pub importance: u8,
    /// Content level of the turn it came from.
    #[serde(default = "default_level")]
    pub level: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nickname {
    pub nickname: String,
    pub frequency: u32,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub kind: String,
    pub description: String,
    pub affection: u8,
    #[serde(default = "default_level")]
    pub level: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dislike {
    pub topic: String,
    pub severity: u8,
    pub evidence: String,
    #[serde(default = "default_level")]
    pub level: u8,
    pub created_at: DateTime<Utc>,
}

/// Per (user, character) distilled memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongTermMemory {
    pub user_id: String,
    pub character_id: String,
    pub preferences: Vec<Preference>,
    pub nicknames: Vec<Nickname>,
    pub milestones: Vec<Milestone>,
    pub dislikes: Vec<Dislike>,
    pub personal_info: BTreeMap<String, String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl LongTermMemory {
    pub fn new(user_id: &str, character_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
            && self.nicknames.is_empty()
            && self.milestones.is_empty()
            && self.dislikes.is_empty()
            && self.personal_info.is_empty()
    }
}
