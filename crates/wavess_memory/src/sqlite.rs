use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::future::Future;
use std::path::Path;

use wavess_core::emotion::{initial_affection, intimacy_for, relationship_for, MILESTONE_TRIGGER};
use wavess_core::memory::LongTermMemory;
use wavess_core::models::{
    Character, Chat, ChatMode, EmotionData, EmotionSnapshot, Message, Mood, Relationship,
};
use wavess_core::retry::{with_retry, RetryConfig};
use wavess_core::{CharacterQuery, CommitOutcome, Store, StoreError, TurnWrite};

use crate::manager::merge_long_term;
use crate::migrations::Migrator;

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", s))
        .map_err(StoreError::Other)
}

fn parse_enum<T: std::str::FromStr<Err = anyhow::Error>>(s: &str) -> Result<T, StoreError> {
    s.parse::<T>().map_err(StoreError::Other)
}

/// Busy/locked databases and dropped connections are retried; unique
/// violations are conflicts; everything else is fatal.
fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
                "5" | "6" | "261" | "262" | "517" => StoreError::Transient(db.message().to_string()),
                // SQLITE_CONSTRAINT_UNIQUE / PRIMARYKEY
                "2067" | "1555" => StoreError::Conflict(db.message().to_string()),
                _ => StoreError::Other(anyhow::Error::new(e)),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(e.to_string()),
        _ => StoreError::Other(anyhow::Error::new(e)),
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    retry: RetryConfig,
}

impl SqliteStore {
    /// Open (creating if needed) and migrate. `":memory:"` gives a private
    /// single-connection database, used by tests.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let store = Self::connect(db_path, 5).await?;
        store.migrator().migrate().await?;
        Ok(store)
    }

    /// Open without running migrations (for the `db` CLI commands).
    pub async fn connect<P: AsRef<Path>>(db_path: P, max_connections: u32) -> Result<Self> {
        let path = db_path.as_ref().display().to_string();
        let options = SqlitePoolOptions::new().after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        });
        let pool = if path == ":memory:" {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
        } else {
            options
                .max_connections(max_connections.max(1))
                .connect(&format!("sqlite://{}?mode=rwc", path))
                .await
        }
        .context("Failed to connect to SQLite database")?;

        Ok(Self {
            pool,
            retry: RetryConfig::with_retries(2),
        })
    }

    /// Number of extra attempts for transient failures.
    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(retries);
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn migrator(&self) -> Migrator {
        Migrator::new(self.pool.clone())
    }

    async fn retrying<T, F, Fut>(&self, label: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.retry, label, StoreError::is_transient, op).await
    }

    /// Number of rows in the emotion history table for a pair.
    pub async fn count_emotion_history(&self, user_id: &str, character_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM emotion_history WHERE user_id = ? AND character_id = ?",
        )
        .bind(user_id)
        .bind(character_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    pub async fn count_messages(&self, chat_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_character(row: &SqliteRow) -> Result<Character, StoreError> {
    let tags: String = row.get("tags");
    Ok(Character {
        id: row.get("id"),
        name: row.get("name"),
        character_type: parse_enum(row.get::<&str, _>("character_type"))?,
        locale: row.get("locale"),
        is_active: row.get::<i64, _>("is_active") != 0,
        user_description: row.get("user_description"),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        popularity: row.get("popularity"),
    })
}

fn row_to_chat(row: &SqliteRow) -> Result<Chat, StoreError> {
    Ok(Chat {
        id: row.get("id"),
        user_id: row.get("user_id"),
        character_id: row.get("character_id"),
        chat_mode: parse_enum(row.get::<&str, _>("chat_mode"))?,
        status: parse_enum(row.get::<&str, _>("status"))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
    let engine: Option<String> = row.get("ai_engine");
    Ok(Message {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        role: parse_enum(row.get::<&str, _>("role"))?,
        content: row.get("content"),
        nsfw_level: row.get::<i64, _>("nsfw_level").clamp(1, 5) as u8,
        ai_engine: engine.as_deref().map(parse_enum).transpose()?,
        reply_to: row.get("reply_to"),
        created_at: parse_ts(row.get("created_at"))?,
    })
}

fn row_to_relationship(row: &SqliteRow) -> Result<Relationship, StoreError> {
    let data: String = row.get("emotion_data");
    let emotion_data: EmotionData = serde_json::from_str(&data).unwrap_or_else(|e| {
        tracing::warn!("Unreadable emotion_data, starting fresh: {}", e);
        EmotionData::default()
    });
    Ok(Relationship {
        id: row.get("id"),
        user_id: row.get("user_id"),
        character_id: row.get("character_id"),
        chat_id: row.get("chat_id"),
        affection: row.get::<i64, _>("affection").clamp(0, 100) as u8,
        mood: parse_enum(row.get::<&str, _>("mood"))?,
        relationship: parse_enum(row.get::<&str, _>("relationship"))?,
        intimacy: parse_enum(row.get::<&str, _>("intimacy"))?,
        total_interactions: row.get("total_interactions"),
        emotion_data,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn emotion_json(data: &EmotionData) -> Result<String, StoreError> {
    serde_json::to_string(data)
        .context("Failed to serialize emotion_data")
        .map_err(StoreError::Other)
}

// ============================================================================
// Statements shared by single writes and the turn transaction
// ============================================================================

async fn insert_message(conn: &mut SqliteConnection, m: &Message) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO messages (id, chat_id, role, content, nsfw_level, ai_engine, reply_to, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&m.id)
    .bind(&m.chat_id)
    .bind(m.role.as_str())
    .bind(&m.content)
    .bind(m.nsfw_level as i64)
    .bind(m.ai_engine.map(|e| e.as_str()))
    .bind(&m.reply_to)
    .bind(ts(&m.created_at))
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;
    Ok(())
}

async fn upsert_relationship(conn: &mut SqliteConnection, r: &Relationship) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO relationships (id, user_id, character_id, chat_id, affection, mood, relationship,
                                   intimacy, total_interactions, emotion_data, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            affection = excluded.affection,
            mood = excluded.mood,
            relationship = excluded.relationship,
            intimacy = excluded.intimacy,
            total_interactions = excluded.total_interactions,
            emotion_data = excluded.emotion_data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&r.id)
    .bind(&r.user_id)
    .bind(&r.character_id)
    .bind(&r.chat_id)
    .bind(r.affection as i64)
    .bind(r.mood.as_str())
    .bind(r.relationship.as_str())
    .bind(r.intimacy.as_str())
    .bind(r.total_interactions)
    .bind(emotion_json(&r.emotion_data)?)
    .bind(ts(&r.updated_at))
    .bind(ts(&r.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;
    Ok(())
}

async fn insert_snapshot(conn: &mut SqliteConnection, s: &EmotionSnapshot) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO emotion_history (user_id, character_id, chat_id, trigger_type, context, \
         affection_before, affection_after, mood_before, mood_after, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&s.user_id)
    .bind(&s.character_id)
    .bind(&s.chat_id)
    .bind(&s.trigger_type)
    .bind(&s.context)
    .bind(s.affection_before as i64)
    .bind(s.affection_after as i64)
    .bind(s.mood_before.as_str())
    .bind(s.mood_after.as_str())
    .bind(ts(&s.created_at))
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;
    Ok(())
}

async fn fetch_relationship(
    conn: &mut SqliteConnection,
    user_id: &str,
    character_id: &str,
    chat_id: Option<&str>,
) -> Result<Option<Relationship>, StoreError> {
    let row = sqlx::query(
        "SELECT * FROM relationships WHERE user_id = ? AND character_id = ? AND chat_id IS ?",
    )
    .bind(user_id)
    .bind(character_id)
    .bind(chat_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_err)?;
    row.as_ref().map(row_to_relationship).transpose()
}

/// The chat-less row for a pair, created from `template` if missing. When
/// another writer creates it first, that row is returned.
async fn fetch_or_create_global(
    conn: &mut SqliteConnection,
    user_id: &str,
    character_id: &str,
    template: Option<&Relationship>,
) -> Result<Relationship, StoreError> {
    if let Some(existing) = fetch_relationship(&mut *conn, user_id, character_id, None).await? {
        return Ok(existing);
    }
    let affection = template
        .map(|t| t.affection)
        .unwrap_or_else(|| initial_affection(user_id, character_id));
    let now = ts(&Utc::now());
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO relationships (id, user_id, character_id, chat_id, affection, mood,
                                             relationship, intimacy, total_interactions, emotion_data,
                                             created_at, updated_at)
        VALUES (?, ?, ?, NULL, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(character_id)
    .bind(affection as i64)
    .bind(template.map(|t| t.mood).unwrap_or(Mood::Neutral).as_str())
    .bind(relationship_for(affection).as_str())
    .bind(intimacy_for(affection).as_str())
    .bind(emotion_json(&EmotionData::default())?)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await
    .map_err(map_err)?;

    fetch_relationship(&mut *conn, user_id, character_id, None)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("global relationship {}/{}", user_id, character_id)))
}

/// Merge the turn's long-term findings into the chat-less row and record
/// crossed thresholds there. Both read the row inside the transaction, so
/// turns from other chats of the same pair are never overwritten. Returns
/// the thresholds reached for the first time.
async fn update_global_row(
    conn: &mut SqliteConnection,
    write: &TurnWrite,
) -> Result<Vec<u8>, StoreError> {
    if write.long_term_memory.is_none() && write.milestones.is_empty() {
        return Ok(Vec::new());
    }
    let pair = write
        .long_term_memory
        .as_ref()
        .map(|m| (m.user_id.as_str(), m.character_id.as_str()))
        .or_else(|| {
            write
                .relationship
                .as_ref()
                .map(|r| (r.user_id.as_str(), r.character_id.as_str()))
        });
    let Some((user_id, character_id)) = pair else {
        return Ok(Vec::new());
    };

    let mut global =
        fetch_or_create_global(&mut *conn, user_id, character_id, write.relationship.as_ref()).await?;
    let mut changed = false;
    if let Some(additions) = &write.long_term_memory {
        let memory = global
            .emotion_data
            .long_term_memory
            .get_or_insert_with(|| LongTermMemory::new(user_id, character_id));
        changed |= merge_long_term(memory, additions);
    }
    let mut new_milestones = Vec::new();
    for threshold in &write.milestones {
        if !global.emotion_data.milestones_reached.contains(threshold) {
            global.emotion_data.milestones_reached.push(*threshold);
            new_milestones.push(*threshold);
        }
    }

    if changed || !new_milestones.is_empty() {
        global.updated_at = Utc::now();
        upsert_relationship(conn, &global).await?;
    }
    Ok(new_milestones)
}

// ============================================================================
// Store implementation
// ============================================================================

impl SqliteStore {
    async fn commit_turn_once(&self, write: &TurnWrite) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        if let Some(m) = &write.user_message {
            insert_message(&mut tx, m).await?;
        }
        if let Some(m) = &write.assistant_message {
            insert_message(&mut tx, m).await?;
        }
        if let Some(r) = &write.relationship {
            upsert_relationship(&mut tx, r).await?;
        }
        let new_milestones = update_global_row(&mut tx, write).await?;
        if let Some(s) = &write.snapshot {
            let mut snapshot = s.clone();
            if !new_milestones.is_empty() {
                snapshot.trigger_type = MILESTONE_TRIGGER.to_string();
            }
            insert_snapshot(&mut tx, &snapshot).await?;
        }
        let chat_id = write
            .assistant_message
            .as_ref()
            .or(write.user_message.as_ref())
            .map(|m| (m.chat_id.clone(), m.created_at));
        if let Some((chat_id, at)) = chat_id {
            sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
                .bind(ts(&at))
                .bind(&chat_id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(CommitOutcome { new_milestones })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_character(&self, id: &str) -> Result<Option<Character>, StoreError> {
        self.retrying("get_character", move || async move {
            let row = sqlx::query("SELECT * FROM characters WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            row.as_ref().map(row_to_character).transpose()
        })
        .await
    }

    async fn list_characters(&self, query: &CharacterQuery) -> Result<Vec<Character>, StoreError> {
        let mut sql = String::from("SELECT * FROM characters WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();
        if query.active_only {
            sql.push_str(" AND is_active = 1");
        }
        if let Some(t) = query.character_type {
            sql.push_str(" AND character_type = ?");
            binds.push(t.as_str().to_string());
        }
        if let Some(locale) = &query.locale {
            sql.push_str(" AND locale = ?");
            binds.push(locale.clone());
        }
        if let Some(tag) = &query.tag {
            sql.push_str(" AND tags LIKE ?");
            binds.push(format!("%\"{}\"%", tag));
        }
        sql.push_str(" ORDER BY popularity DESC, name ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let sql = &sql;
        let binds = &binds;
        self.retrying("list_characters", move || async move {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = q.bind(b);
            }
            let rows = q.fetch_all(&self.pool).await.map_err(map_err)?;
            rows.iter().map(row_to_character).collect()
        })
        .await
    }

    async fn upsert_character(&self, c: &Character) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&c.tags)
            .context("Failed to serialize tags")
            .map_err(StoreError::Other)?;
        let tags = &tags;
        self.retrying("upsert_character", move || async move {
            let now = ts(&Utc::now());
            sqlx::query(
                r#"
                INSERT INTO characters (id, name, character_type, locale, is_active, user_description,
                                        tags, popularity, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    character_type = excluded.character_type,
                    locale = excluded.locale,
                    is_active = excluded.is_active,
                    user_description = excluded.user_description,
                    tags = excluded.tags,
                    popularity = excluded.popularity,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&c.id)
            .bind(&c.name)
            .bind(c.character_type.as_str())
            .bind(&c.locale)
            .bind(c.is_active as i64)
            .bind(&c.user_description)
            .bind(tags)
            .bind(c.popularity)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn create_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        self.retrying("create_chat", move || async move {
            sqlx::query(
                "INSERT INTO chats (id, user_id, character_id, chat_mode, status, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chat.id)
            .bind(&chat.user_id)
            .bind(&chat.character_id)
            .bind(chat.chat_mode.as_str())
            .bind(chat.status.as_str())
            .bind(ts(&chat.created_at))
            .bind(ts(&chat.updated_at))
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        self.retrying("get_chat", move || async move {
            let row = sqlx::query("SELECT * FROM chats WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            row.as_ref().map(row_to_chat).transpose()
        })
        .await
    }

    async fn ensure_chat_exists(
        &self,
        chat_id: &str,
        user_id: &str,
        character_id: &str,
        mode: ChatMode,
    ) -> Result<Chat, StoreError> {
        let fresh = Chat::new(chat_id, user_id, character_id, mode);
        let fresh = &fresh;
        let chat = self
            .retrying("ensure_chat_exists", move || async move {
                sqlx::query(
                    "INSERT OR IGNORE INTO chats (id, user_id, character_id, chat_mode, status, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&fresh.id)
                .bind(&fresh.user_id)
                .bind(&fresh.character_id)
                .bind(fresh.chat_mode.as_str())
                .bind(fresh.status.as_str())
                .bind(ts(&fresh.created_at))
                .bind(ts(&fresh.updated_at))
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
                let row = sqlx::query("SELECT * FROM chats WHERE id = ?")
                    .bind(&fresh.id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
                row_to_chat(&row)
            })
            .await?;

        if chat.user_id != user_id || chat.character_id != character_id {
            return Err(StoreError::Conflict(format!(
                "chat {} belongs to another user or character",
                chat_id
            )));
        }
        Ok(chat)
    }

    async fn append_message(&self, message: &Message) -> Result<String, StoreError> {
        self.retrying("append_message", move || async move {
            let mut conn = self.pool.acquire().await.map_err(map_err)?;
            insert_message(&mut conn, message).await?;
            Ok(message.id.clone())
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        self.retrying("get_message", move || async move {
            let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            row.as_ref().map(row_to_message).transpose()
        })
        .await
    }

    async fn find_reply(&self, user_message_id: &str) -> Result<Option<Message>, StoreError> {
        self.retrying("find_reply", move || async move {
            let row = sqlx::query("SELECT * FROM messages WHERE reply_to = ? AND role = 'assistant'")
                .bind(user_message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            row.as_ref().map(row_to_message).transpose()
        })
        .await
    }

    async fn get_recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.retrying("get_recent_messages", move || async move {
            let rows = sqlx::query(
                r#"
                SELECT * FROM (
                    SELECT * FROM messages WHERE chat_id = ?
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                ) ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(chat_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            rows.iter().map(row_to_message).collect()
        })
        .await
    }

    async fn get_relationship(
        &self,
        user_id: &str,
        character_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Option<Relationship>, StoreError> {
        self.retrying("get_relationship", move || async move {
            let mut conn = self.pool.acquire().await.map_err(map_err)?;
            fetch_relationship(&mut conn, user_id, character_id, chat_id).await
        })
        .await
    }

    async fn get_or_create_relationship(&self, seed: &Relationship) -> Result<Relationship, StoreError> {
        self.retrying("get_or_create_relationship", move || async move {
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            let existing = fetch_relationship(
                &mut tx,
                &seed.user_id,
                &seed.character_id,
                seed.chat_id.as_deref(),
            )
            .await?;
            let row = match existing {
                Some(r) => r,
                None => {
                    upsert_relationship(&mut tx, seed).await?;
                    tracing::debug!(
                        user_id = %seed.user_id,
                        character_id = %seed.character_id,
                        affection = seed.affection,
                        "Relationship created"
                    );
                    seed.clone()
                }
            };
            tx.commit().await.map_err(map_err)?;
            Ok(row)
        })
        .await
    }

    async fn update_relationship(&self, relationship: &Relationship) -> Result<(), StoreError> {
        self.retrying("update_relationship", move || async move {
            let mut conn = self.pool.acquire().await.map_err(map_err)?;
            upsert_relationship(&mut conn, relationship).await
        })
        .await
    }

    async fn append_emotion_snapshot(&self, snapshot: &EmotionSnapshot) -> Result<(), StoreError> {
        self.retrying("append_emotion_snapshot", move || async move {
            let mut conn = self.pool.acquire().await.map_err(map_err)?;
            insert_snapshot(&mut conn, snapshot).await
        })
        .await
    }

    async fn commit_turn(&self, write: &TurnWrite) -> Result<CommitOutcome, StoreError> {
        self.retrying("commit_turn", move || self.commit_turn_once(write))
            .await
    }
}
