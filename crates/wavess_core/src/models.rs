//! Domain entities shared by every layer of the turn engine.
//!
//! Enumerations are stored as strings at rest (`as_str` / `FromStr`) and as
//! tagged variants in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => anyhow::bail!("unknown {} value: {}", stringify!($name), other),
                }
            }
        }
    };
}

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

string_enum!(Role { User => "user", Assistant => "assistant" });

/// Upstream provider family selected by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Safe,
    Creative,
}

string_enum!(Engine { Safe => "safe", Creative => "creative" });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Casual,
    Novel,
}

string_enum!(ChatMode { Casual => "casual", Novel => "novel" });

impl ChatMode {
    /// Target reply length in characters, inclusive.
    pub fn word_bounds(&self) -> (usize, usize) {
        match self {
            ChatMode::Casual => (150, 250),
            ChatMode::Novel => (400, 500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Active,
    Archived,
}

string_enum!(ChatStatus { Active => "active", Archived => "archived" });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Neutral,
    Happy,
    Excited,
    Shy,
    Romantic,
    Passionate,
    Pleased,
    Loving,
    Friendly,
    Polite,
    Concerned,
    Annoyed,
    Upset,
    Disappointed,
}

string_enum!(Mood {
    Neutral => "neutral",
    Happy => "happy",
    Excited => "excited",
    Shy => "shy",
    Romantic => "romantic",
    Passionate => "passionate",
    Pleased => "pleased",
    Loving => "loving",
    Friendly => "friendly",
    Polite => "polite",
    Concerned => "concerned",
    Annoyed => "annoyed",
    Upset => "upset",
    Disappointed => "disappointed",
});

impl Mood {
    pub const ALL: [Mood; 14] = [
        Mood::Neutral,
        Mood::Happy,
        Mood::Excited,
        Mood::Shy,
        Mood::Romantic,
        Mood::Passionate,
        Mood::Pleased,
        Mood::Loving,
        Mood::Friendly,
        Mood::Polite,
        Mood::Concerned,
        Mood::Annoyed,
        Mood::Upset,
        Mood::Disappointed,
    ];
}

/// Ordered from coldest to warmest; derived solely from affection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipTier {
    #[default]
    Stranger,
    Acquaintance,
    Friend,
    CloseFriend,
    Romantic,
    Lover,
    DeepLove,
}

string_enum!(RelationshipTier {
    Stranger => "stranger",
    Acquaintance => "acquaintance",
    Friend => "friend",
    CloseFriend => "close_friend",
    Romantic => "romantic",
    Lover => "lover",
    DeepLove => "deep_love",
});

impl RelationshipTier {
    pub fn display_name(&self) -> &'static str {
        match self {
            RelationshipTier::Stranger => "陌生人",
            RelationshipTier::Acquaintance => "認識",
            RelationshipTier::Friend => "朋友",
            RelationshipTier::CloseFriend => "好友",
            RelationshipTier::Romantic => "戀人",
            RelationshipTier::Lover => "愛人",
            RelationshipTier::DeepLove => "摯愛",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntimacyTier {
    #[default]
    Distant,
    Polite,
    Friendly,
    Close,
    Intimate,
    DeeplyIntimate,
}

string_enum!(IntimacyTier {
    Distant => "distant",
    Polite => "polite",
    Friendly => "friendly",
    Close => "close",
    Intimate => "intimate",
    DeeplyIntimate => "deeply_intimate",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterType {
    Dominant,
    Gentle,
    Playful,
    Mystery,
    Reliable,
}

string_enum!(CharacterType {
    Dominant => "dominant",
    Gentle => "gentle",
    Playful => "playful",
    Mystery => "mystery",
    Reliable => "reliable",
});

impl CharacterType {
    pub fn display_name(&self) -> &'static str {
        match self {
            CharacterType::Dominant => "霸道型",
            CharacterType::Gentle => "溫柔型",
            CharacterType::Playful => "活潑型",
            CharacterType::Mystery => "神秘型",
            CharacterType::Reliable => "可靠型",
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Read-only character aggregate consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub character_type: CharacterType,
    pub locale: String,
    pub is_active: bool,
    pub user_description: String,
    pub tags: Vec<String>,
    pub popularity: i64,
}

impl Character {
    /// Characters tagged for adult content always use the creative provider.
    pub fn is_adult(&self) -> bool {
        self.tags
            .iter()
            .any(|t| t.eq_ignore_ascii_case("nsfw") || t.eq_ignore_ascii_case("adult"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub character_id: String,
    pub chat_mode: ChatMode,
    pub status: ChatStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: &str, user_id: &str, character_id: &str, chat_mode: ChatMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            chat_mode,
            status: ChatStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub nsfw_level: u8,
    /// `None` for user messages.
    pub ai_engine: Option<Engine>,
    /// For assistant messages, the user message this reply answers.
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-turn audit entry for an affection change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionSnapshot {
    pub user_id: String,
    pub character_id: String,
    pub chat_id: Option<String>,
    pub trigger_type: String,
    pub context: String,
    pub affection_before: u8,
    pub affection_after: u8,
    pub mood_before: Mood,
    pub mood_after: Mood,
    pub created_at: DateTime<Utc>,
}

/// Compact history entry kept inside `EmotionData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub trigger_type: String,
    pub trigger_content: String,
    pub old_affection: u8,
    pub new_affection: u8,
    pub affection_change: i32,
    pub old_mood: Mood,
    pub new_mood: Mood,
}

/// Structured form of the relationship row's `emotion_data` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionData {
    pub nsfw_sticky: bool,
    /// Affection thresholds whose milestone already fired for the pair.
    /// Kept on the global (chat-less) row only.
    pub milestones_reached: Vec<u8>,
    pub history: Vec<EmotionHistoryEntry>,
    /// Long-term memory lives on the global (chat-less) row only.
    pub long_term_memory: Option<crate::memory::LongTermMemory>,
}

pub const EMOTION_HISTORY_CAP: usize = 50;

impl EmotionData {
    pub fn push_history(&mut self, entry: EmotionHistoryEntry) {
        if self.history.len() >= EMOTION_HISTORY_CAP {
            let overflow = self.history.len() + 1 - EMOTION_HISTORY_CAP;
            self.history.drain(..overflow);
        }
        self.history.push(entry);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub user_id: String,
    pub character_id: String,
    pub chat_id: Option<String>,
    pub affection: u8,
    pub mood: Mood,
    pub relationship: RelationshipTier,
    pub intimacy: IntimacyTier,
    pub total_interactions: i64,
    pub emotion_data: EmotionData,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Caller-supplied preferences
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseLength {
    Short,
    #[default]
    Medium,
    Long,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStyle {
    #[default]
    Romantic,
    Warm,
    Professional,
}

/// Closed set of per-user knobs. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UserPreferences {
    pub response_length: ResponseLength,
    pub scene_style: SceneStyle,
    pub nsfw_enabled: bool,
    pub max_nsfw_level: u8,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            response_length: ResponseLength::Medium,
            scene_style: SceneStyle::Romantic,
            nsfw_enabled: true,
            max_nsfw_level: 5,
        }
    }
}

impl UserPreferences {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let prefs: UserPreferences = serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::InvalidPreferences(e.to_string()))?;
        if !(1..=5).contains(&prefs.max_nsfw_level) {
            return Err(ConfigError::InvalidPreferences(format!(
                "max_nsfw_level must be within 1..=5, got {}",
                prefs.max_nsfw_level
            )));
        }
        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_string_round_trip() {
        assert_eq!(RelationshipTier::CloseFriend.as_str(), "close_friend");
        assert_eq!(
            "deeply_intimate".parse::<IntimacyTier>().unwrap(),
            IntimacyTier::DeeplyIntimate
        );
        assert!("soulmate".parse::<RelationshipTier>().is_err());
    }

    #[test]
    fn test_adult_tags() {
        let mut c = Character {
            id: "c1".into(),
            name: "沈宸".into(),
            character_type: CharacterType::Dominant,
            locale: "zh-TW".into(),
            is_active: true,
            user_description: String::new(),
            tags: vec!["romance".into()],
            popularity: 0,
        };
        assert!(!c.is_adult());
        c.tags.push("NSFW".into());
        assert!(c.is_adult());
    }

    #[test]
    fn test_history_is_capped() {
        let mut data = EmotionData::default();
        for i in 0..60u8 {
            data.push_history(EmotionHistoryEntry {
                timestamp: Utc::now(),
                trigger_type: "message".into(),
                trigger_content: format!("{}", i),
                old_affection: i,
                new_affection: i + 1,
                affection_change: 1,
                old_mood: Mood::Neutral,
                new_mood: Mood::Neutral,
            });
        }
        assert_eq!(data.history.len(), EMOTION_HISTORY_CAP);
        assert_eq!(data.history[0].old_affection, 10);
    }

    #[test]
    fn test_preferences_reject_unknown_keys() {
        let ok = UserPreferences::from_json(&json!({"scene_style": "warm"})).unwrap();
        assert_eq!(ok.scene_style, SceneStyle::Warm);
        assert_eq!(ok.max_nsfw_level, 5);

        let err = UserPreferences::from_json(&json!({"favorite_color": "red"}));
        assert!(err.is_err());

        let err = UserPreferences::from_json(&json!({"max_nsfw_level": 9}));
        assert!(err.is_err());
    }
}
