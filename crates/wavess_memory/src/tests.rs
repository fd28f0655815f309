use crate::manager::extract_turn;
use crate::sqlite::SqliteStore;
use chrono::{Duration, Utc};
use wavess_core::memory::LongTermMemory;
use wavess_core::models::{
    Character, CharacterType, ChatMode, EmotionSnapshot, Engine, Message, Mood, Relationship, Role,
};
use wavess_core::{CharacterQuery, CommitOutcome, Store, StoreError, TurnWrite};

fn message(id: &str, chat_id: &str, role: Role, content: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        role,
        content: content.to_string(),
        nsfw_level: 1,
        ai_engine: match role {
            Role::User => None,
            Role::Assistant => Some(Engine::Safe),
        },
        reply_to: None,
        created_at: Utc::now() + Duration::seconds(secs),
    }
}

fn relationship(user: &str, character: &str, chat: Option<&str>, affection: u8) -> Relationship {
    let lex = wavess_core::Lexicon::builtin().unwrap();
    let mut r = wavess_core::emotion::EmotionManager::new(&lex.emotion)
        .new_relationship(user, character, chat);
    r.affection = affection;
    r
}

async fn store_with_chat(chat_id: &str) -> SqliteStore {
    let store = SqliteStore::new(":memory:").await.expect("Failed to create store");
    store
        .ensure_chat_exists(chat_id, "u1", "c1", ChatMode::Casual)
        .await
        .expect("Failed to create chat");
    store
}

#[tokio::test]
async fn test_character_roundtrip_and_query() {
    let store = SqliteStore::new(":memory:").await.unwrap();
    let mut c = Character {
        id: "c1".into(),
        name: "沈宸".into(),
        character_type: CharacterType::Dominant,
        locale: "zh-TW".into(),
        is_active: true,
        user_description: "冷靜理性".into(),
        tags: vec!["總裁".into(), "nsfw".into()],
        popularity: 5,
    };
    store.upsert_character(&c).await.unwrap();
    c.is_active = false;
    c.id = "c2".into();
    c.character_type = CharacterType::Gentle;
    c.tags = vec!["醫生".into()];
    store.upsert_character(&c).await.unwrap();

    let loaded = store.get_character("c1").await.unwrap().unwrap();
    assert_eq!(loaded.tags, vec!["總裁".to_string(), "nsfw".to_string()]);
    assert!(loaded.is_adult());

    let active = store
        .list_characters(&CharacterQuery {
            active_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);

    let tagged = store
        .list_characters(&CharacterQuery {
            tag: Some("醫生".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, "c2");
}

#[tokio::test]
async fn test_ensure_chat_exists_rejects_other_owner() {
    let store = store_with_chat("chat-1").await;
    let again = store
        .ensure_chat_exists("chat-1", "u1", "c1", ChatMode::Novel)
        .await
        .unwrap();
    // Existing chat keeps its original mode.
    assert_eq!(again.chat_mode, ChatMode::Casual);

    let err = store
        .ensure_chat_exists("chat-1", "intruder", "c1", ChatMode::Casual)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_recent_messages_oldest_first() {
    let store = store_with_chat("chat-1").await;
    for i in 0..6 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .append_message(&message(&format!("m{}", i), "chat-1", role, &format!("#{}", i), i))
            .await
            .unwrap();
    }

    let recent = store.get_recent_messages("chat-1", 4).await.unwrap();
    let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["#2", "#3", "#4", "#5"]);
    assert!(recent.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn test_equal_timestamps_break_ties_by_id() {
    let store = store_with_chat("chat-1").await;
    let at = Utc::now();
    for id in ["b", "a", "c"] {
        let mut m = message(id, "chat-1", Role::User, id, 0);
        m.created_at = at;
        store.append_message(&m).await.unwrap();
    }
    let recent = store.get_recent_messages("chat-1", 10).await.unwrap();
    let ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_commit_turn_writes_everything() {
    let store = store_with_chat("chat-1").await;
    let user = message("u-1", "chat-1", Role::User, "今天好累", 0);
    let mut assistant = message("a-1", "chat-1", Role::Assistant, "辛苦了", 1);
    assistant.reply_to = Some("u-1".into());

    let rel = relationship("u1", "c1", Some("chat-1"), 40);
    let rel = store.get_or_create_relationship(&rel).await.unwrap();
    let mut updated = rel.clone();
    updated.affection = 42;
    updated.total_interactions = 1;

    let mut ltm = LongTermMemory::new("u1", "c1");
    ltm.personal_info.insert("age".into(), "我今年25歲".into());

    let write = TurnWrite {
        user_message: Some(user),
        assistant_message: Some(assistant),
        relationship: Some(updated),
        snapshot: Some(EmotionSnapshot {
            user_id: "u1".into(),
            character_id: "c1".into(),
            chat_id: Some("chat-1".into()),
            trigger_type: "message".into(),
            context: "今天好累".into(),
            affection_before: 40,
            affection_after: 42,
            mood_before: Mood::Neutral,
            mood_after: Mood::Friendly,
            created_at: Utc::now(),
        }),
        long_term_memory: Some(ltm),
        milestones: Vec::new(),
    };
    store.commit_turn(&write).await.unwrap();

    assert_eq!(store.count_messages("chat-1").await.unwrap(), 2);
    assert_eq!(store.count_emotion_history("u1", "c1").await.unwrap(), 1);

    let reply = store.find_reply("u-1").await.unwrap().unwrap();
    assert_eq!(reply.id, "a-1");

    let chat_row = store
        .get_relationship("u1", "c1", Some("chat-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat_row.affection, 42);
    assert!(chat_row.emotion_data.long_term_memory.is_none());

    // Long-term memory lands on the chat-less row.
    let global = store.get_relationship("u1", "c1", None).await.unwrap().unwrap();
    let stored = global.emotion_data.long_term_memory.unwrap();
    assert_eq!(stored.personal_info.get("age").map(String::as_str), Some("我今年25歲"));
}

/// One turn on `chat_id` for u1/c1 whose user text yields long-term findings.
fn turn_write(chat_id: &str, text: &str, milestones: Vec<u8>) -> TurnWrite {
    let user = message(&format!("{}-u", chat_id), chat_id, Role::User, text, 0);
    let mut assistant = message(&format!("{}-a", chat_id), chat_id, Role::Assistant, "好呀", 1);
    assistant.reply_to = Some(user.id.clone());
    TurnWrite {
        user_message: Some(user),
        assistant_message: Some(assistant),
        relationship: Some(relationship("u1", "c1", Some(chat_id), 40)),
        snapshot: Some(EmotionSnapshot {
            user_id: "u1".into(),
            character_id: "c1".into(),
            chat_id: Some(chat_id.into()),
            trigger_type: "message".into(),
            context: text.into(),
            affection_before: 39,
            affection_after: 40,
            mood_before: Mood::Neutral,
            mood_after: Mood::Friendly,
            created_at: Utc::now(),
        }),
        long_term_memory: Some(extract_turn("u1", "c1", text, "寶貝", 1, 40, Utc::now())),
        milestones,
    }
}

async fn global_memory(store: &SqliteStore) -> LongTermMemory {
    store
        .get_relationship("u1", "c1", None)
        .await
        .unwrap()
        .and_then(|g| g.emotion_data.long_term_memory)
        .unwrap()
}

#[tokio::test]
async fn test_long_term_memory_merges_into_current_row() {
    let store = store_with_chat("chat-a").await;
    store
        .ensure_chat_exists("chat-b", "u1", "c1", ChatMode::Casual)
        .await
        .unwrap();

    // Both turns were prepared before either committed.
    let a = turn_write("chat-a", "我喜歡貓咪", Vec::new());
    let b = turn_write("chat-b", "我喜歡下雨天", Vec::new());
    store.commit_turn(&a).await.unwrap();
    store.commit_turn(&b).await.unwrap();

    let stored = global_memory(&store).await;
    let prefs: Vec<&str> = stored.preferences.iter().map(|p| p.content.as_str()).collect();
    assert_eq!(prefs, vec!["我喜歡貓咪", "我喜歡下雨天"]);
    assert_eq!(stored.nicknames[0].frequency, 2);
}

#[tokio::test]
async fn test_concurrent_commits_share_one_global_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("wavess.db"))
        .await
        .unwrap()
        .with_transient_retries(5);
    for chat in ["chat-a", "chat-b"] {
        store
            .ensure_chat_exists(chat, "u1", "c1", ChatMode::Casual)
            .await
            .unwrap();
    }

    let a = turn_write("chat-a", "我喜歡貓咪", Vec::new());
    let b = turn_write("chat-b", "我喜歡下雨天", Vec::new());
    let (ra, rb) = tokio::join!(store.commit_turn(&a), store.commit_turn(&b));
    ra.unwrap();
    rb.unwrap();

    let globals: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM relationships WHERE user_id = 'u1' AND character_id = 'c1' AND chat_id IS NULL",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(globals, 1);
    assert_eq!(global_memory(&store).await.preferences.len(), 2);
}

#[tokio::test]
async fn test_milestone_recorded_once_per_pair() {
    let store = store_with_chat("chat-a").await;
    store
        .ensure_chat_exists("chat-b", "u1", "c1", ChatMode::Casual)
        .await
        .unwrap();

    let first = store
        .commit_turn(&turn_write("chat-a", "你好", vec![40]))
        .await
        .unwrap();
    assert_eq!(first, CommitOutcome { new_milestones: vec![40] });
    let second = store
        .commit_turn(&turn_write("chat-b", "你好", vec![40]))
        .await
        .unwrap();
    assert!(second.new_milestones.is_empty());

    let global = store.get_relationship("u1", "c1", None).await.unwrap().unwrap();
    assert_eq!(global.emotion_data.milestones_reached, vec![40]);
    let chat_row = store
        .get_relationship("u1", "c1", Some("chat-b"))
        .await
        .unwrap()
        .unwrap();
    assert!(chat_row.emotion_data.milestones_reached.is_empty());

    // Only the turn that reached the threshold is logged as a milestone.
    let milestones: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM emotion_history WHERE trigger_type = 'milestone'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(milestones, 1);
}

#[tokio::test]
async fn test_failed_commit_leaves_nothing_behind() {
    let store = store_with_chat("chat-1").await;
    let user = message("u-1", "chat-1", Role::User, "第一句", 0);
    store.append_message(&user).await.unwrap();

    // Reusing the user message id fails the insert; the assistant half must not survive.
    let mut assistant = message("a-1", "chat-1", Role::Assistant, "回覆", 1);
    assistant.reply_to = Some("u-1".into());
    let write = TurnWrite {
        user_message: Some(user),
        assistant_message: Some(assistant),
        ..Default::default()
    };
    let err = store.commit_turn(&write).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    assert_eq!(store.count_messages("chat-1").await.unwrap(), 1);
    assert!(store.find_reply("u-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_one_reply_per_user_message() {
    let store = store_with_chat("chat-1").await;
    store
        .append_message(&message("u-1", "chat-1", Role::User, "嗨", 0))
        .await
        .unwrap();
    let mut first = message("a-1", "chat-1", Role::Assistant, "嗨", 1);
    first.reply_to = Some("u-1".into());
    store.append_message(&first).await.unwrap();

    let mut second = message("a-2", "chat-1", Role::Assistant, "又是我", 2);
    second.reply_to = Some("u-1".into());
    let err = store.append_message(&second).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn test_relationship_rows_are_unique_per_scope() {
    let store = store_with_chat("chat-1").await;
    let first = store
        .get_or_create_relationship(&relationship("u1", "c1", Some("chat-1"), 30))
        .await
        .unwrap();
    // A second seed for the same scope returns the stored row, not the seed.
    let second = store
        .get_or_create_relationship(&relationship("u1", "c1", Some("chat-1"), 99))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.affection, 30);

    let global = store
        .get_or_create_relationship(&relationship("u1", "c1", None, 50))
        .await
        .unwrap();
    assert_ne!(global.id, first.id);
    assert!(global.chat_id.is_none());
}

#[tokio::test]
async fn test_sticky_flag_survives_reload() {
    let store = store_with_chat("chat-1").await;
    let mut rel = store
        .get_or_create_relationship(&relationship("u1", "c1", Some("chat-1"), 30))
        .await
        .unwrap();
    rel.emotion_data.nsfw_sticky = true;
    store.update_relationship(&rel).await.unwrap();

    let loaded = store
        .get_relationship("u1", "c1", Some("chat-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.emotion_data.nsfw_sticky);
}

#[tokio::test]
async fn test_file_database_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wavess.db");
    {
        let store = SqliteStore::new(&path).await.unwrap();
        store
            .ensure_chat_exists("chat-1", "u1", "c1", ChatMode::Casual)
            .await
            .unwrap();
        store
            .append_message(&message("m1", "chat-1", Role::User, "記得我", 0))
            .await
            .unwrap();
        store.pool().close().await;
    }
    let store = SqliteStore::new(&path).await.unwrap();
    let recent = store.get_recent_messages("chat-1", 5).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].content, "記得我");
}
