//! Seed characters for development databases.

use anyhow::{Context, Result};
use tracing::info;

use wavess_core::models::{Character, CharacterType};
use wavess_core::Store;

use crate::sqlite::SqliteStore;

fn character(
    id: &str,
    name: &str,
    character_type: CharacterType,
    description: &str,
    tags: &[&str],
) -> Character {
    Character {
        id: id.to_string(),
        name: name.to_string(),
        character_type,
        locale: "zh-TW".to_string(),
        is_active: true,
        user_description: description.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        popularity: 0,
    }
}

pub fn characters() -> Vec<Character> {
    vec![
        character(
            "character_01",
            "沈宸",
            CharacterType::Dominant,
            "沈氏集團的年輕總裁，外表冷靜理性，說話簡短直接，習慣掌控局面。\
             對在意的人卻格外體貼，會用行動而不是言語表達關心。",
            &["總裁", "霸道", "都市"],
        ),
        character(
            "character_02",
            "林知遠",
            CharacterType::Gentle,
            "在醫院工作的年輕醫生，溫柔細心，善於傾聽，說話輕聲細語。\
             總是先關心對方的身體與心情，給人安心的感覺。",
            &["醫生", "溫柔", "治癒"],
        ),
        character(
            "character_03",
            "周曜",
            CharacterType::Playful,
            "正在走紅的樂團主唱，開朗活潑又幽默，喜歡逗人開心。\
             表面愛玩，遇到重要的事情卻很熱情真誠。",
            &["偶像", "陽光", "校園"],
        ),
    ]
}

/// Upsert the seed characters. With `recreate`, their chats, messages and
/// relationship state are wiped first.
pub async fn load(store: &SqliteStore, recreate: bool) -> Result<usize> {
    let seeds = characters();

    if recreate {
        let mut tx = store
            .pool()
            .begin()
            .await
            .context("Failed to begin fixture transaction")?;
        for c in &seeds {
            sqlx::query(
                "DELETE FROM messages WHERE chat_id IN (SELECT id FROM chats WHERE character_id = ?)",
            )
            .bind(&c.id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete fixture messages")?;
            for table in ["chats", "relationships", "emotion_history", "characters"] {
                let column = if table == "characters" { "id" } else { "character_id" };
                sqlx::query(&format!("DELETE FROM {} WHERE {} = ?", table, column))
                    .bind(&c.id)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to clear {}", table))?;
            }
        }
        tx.commit().await.context("Failed to commit fixture wipe")?;
        info!(count = seeds.len(), "Cleared fixture characters");
    }

    for c in &seeds {
        store
            .upsert_character(c)
            .await
            .with_context(|| format!("Failed to upsert character {}", c.id))?;
    }
    info!(count = seeds.len(), recreate, "Loaded fixture characters");
    Ok(seeds.len())
}
