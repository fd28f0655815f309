pub mod classifier;
pub mod config;
pub mod consistency;
pub mod conversation;
pub mod emotion;
pub mod error;
pub mod lexicon;
pub mod memory;
pub mod models;
pub mod retry;
pub mod router;

pub use classifier::{Classification, ContentClassifier};
pub use config::WavessConfig;
pub use error::{ConfigError, StoreError};
pub use lexicon::Lexicon;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use memory::LongTermMemory;
use models::{Character, CharacterType, Chat, ChatMode, EmotionSnapshot, Message, Relationship};

/// Filter for `Store::list_characters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterQuery {
    pub character_type: Option<CharacterType>,
    pub locale: Option<String>,
    pub tag: Option<String>,
    pub active_only: bool,
    pub limit: Option<u32>,
}

/// Everything one turn writes. Applied atomically by `Store::commit_turn`.
#[derive(Debug, Clone, Default)]
pub struct TurnWrite {
    pub user_message: Option<Message>,
    pub assistant_message: Option<Message>,
    pub relationship: Option<Relationship>,
    pub snapshot: Option<EmotionSnapshot>,
    /// This turn's long-term findings, merged into the chat-less relationship
    /// row for this user and character as it stands at commit time.
    pub long_term_memory: Option<LongTermMemory>,
    /// Affection thresholds crossed this turn. Each is recorded once per
    /// (user, character) on the chat-less row.
    pub milestones: Vec<u8>,
}

/// What `Store::commit_turn` decided while applying a `TurnWrite`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Thresholds from `TurnWrite::milestones` not reached before this turn.
    pub new_milestones: Vec<u8>,
}

/// Persistence port used by the turn engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_character(&self, id: &str) -> Result<Option<Character>, StoreError>;
    async fn list_characters(&self, query: &CharacterQuery) -> Result<Vec<Character>, StoreError>;
    async fn upsert_character(&self, character: &Character) -> Result<(), StoreError>;

    async fn create_chat(&self, chat: &Chat) -> Result<(), StoreError>;
    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError>;
    /// Create the chat if missing. An existing chat owned by someone else is a conflict.
    async fn ensure_chat_exists(
        &self,
        chat_id: &str,
        user_id: &str,
        character_id: &str,
        mode: ChatMode,
    ) -> Result<Chat, StoreError>;

    async fn append_message(&self, message: &Message) -> Result<String, StoreError>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError>;
    /// The assistant message answering `user_message_id`, if one was committed.
    async fn find_reply(&self, user_message_id: &str) -> Result<Option<Message>, StoreError>;
    /// Last `limit` messages of a chat, oldest first.
    async fn get_recent_messages(&self, chat_id: &str, limit: usize)
        -> Result<Vec<Message>, StoreError>;

    async fn get_relationship(
        &self,
        user_id: &str,
        character_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Option<Relationship>, StoreError>;
    /// Insert `seed` unless a row for its (user, character, chat) exists; return the stored row.
    async fn get_or_create_relationship(&self, seed: &Relationship)
        -> Result<Relationship, StoreError>;
    async fn update_relationship(&self, relationship: &Relationship) -> Result<(), StoreError>;
    async fn append_emotion_snapshot(&self, snapshot: &EmotionSnapshot) -> Result<(), StoreError>;

    async fn commit_turn(&self, write: &TurnWrite) -> Result<CommitOutcome, StoreError>;
}
