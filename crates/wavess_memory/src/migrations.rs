//! Versioned schema migrations tracked in `schema_migrations`.
//!
//! Migrations are applied in groups: one `migrate` call applies every pending
//! migration under a new group number, and `rollback` undoes the last group.
//! The built-in set defines the canonical schema; extra `*.up.sql` /
//! `*.down.sql` pairs can be loaded from a directory.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Sortable timestamp, `YYYYMMDDHHMMSS`.
    pub version: String,
    pub name: String,
    pub up: String,
    pub down: String,
}

impl Migration {
    fn builtin(version: &str, name: &str, up: &str, down: &str) -> Self {
        Self {
            version: version.to_string(),
            name: name.to_string(),
            up: up.to_string(),
            down: down.to_string(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: String,
    pub name: String,
    /// Group number when applied.
    pub group: Option<i64>,
    pub applied_at: Option<String>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.group.is_some()
    }
}

pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::builtin(
            "20250101000001",
            "create_characters",
            r#"
            CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                character_type TEXT NOT NULL,
                locale TEXT NOT NULL DEFAULT 'zh-TW',
                is_active INTEGER NOT NULL DEFAULT 1,
                user_description TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                popularity INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_characters_type ON characters(character_type);
            "#,
            "DROP TABLE IF EXISTS characters;",
        ),
        Migration::builtin(
            "20250101000002",
            "create_chats",
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                character_id TEXT NOT NULL,
                chat_mode TEXT NOT NULL DEFAULT 'casual',
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at DESC);
            "#,
            "DROP TABLE IF EXISTS chats;",
        ),
        Migration::builtin(
            "20250101000003",
            "create_messages",
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                nsfw_level INTEGER NOT NULL DEFAULT 1,
                ai_engine TEXT,
                reply_to TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_created ON messages(chat_id, created_at DESC);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to) WHERE reply_to IS NOT NULL;
            "#,
            "DROP TABLE IF EXISTS messages;",
        ),
        Migration::builtin(
            "20250101000004",
            "create_relationships",
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                character_id TEXT NOT NULL,
                chat_id TEXT,
                affection INTEGER NOT NULL CHECK (affection BETWEEN 0 AND 100),
                mood TEXT NOT NULL,
                relationship TEXT NOT NULL,
                intimacy TEXT NOT NULL,
                total_interactions INTEGER NOT NULL DEFAULT 0,
                emotion_data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_global
                ON relationships(user_id, character_id) WHERE chat_id IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_chat
                ON relationships(chat_id) WHERE chat_id IS NOT NULL;
            "#,
            "DROP TABLE IF EXISTS relationships;",
        ),
        Migration::builtin(
            "20250101000005",
            "create_emotion_history",
            r#"
            CREATE TABLE IF NOT EXISTS emotion_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                character_id TEXT NOT NULL,
                chat_id TEXT,
                trigger_type TEXT NOT NULL,
                context TEXT NOT NULL,
                affection_before INTEGER NOT NULL,
                affection_after INTEGER NOT NULL,
                mood_before TEXT NOT NULL,
                mood_after TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emotion_history_pair
                ON emotion_history(user_id, character_id, created_at DESC);
            "#,
            "DROP TABLE IF EXISTS emotion_history;",
        ),
    ]
}

/// Split a script into statements. Migration SQL must not put `;` inside literals.
fn statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| {
        s.lines()
            .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with("--"))
    })
}

/// Read `<version>_<name>.up.sql` / `.down.sql` pairs from `dir`.
pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<Migration>> {
    let dir = dir.as_ref();
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read migrations dir: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let Some(stem) = file.strip_suffix(".up.sql") else {
            continue;
        };
        let Some((version, name)) = stem.split_once('_') else {
            tracing::warn!("Skipping migration with unexpected name: {}", file);
            continue;
        };
        let up = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let down_path = dir.join(format!("{}.down.sql", stem));
        let down = std::fs::read_to_string(&down_path).unwrap_or_default();
        out.push(Migration {
            version: version.to_string(),
            name: name.to_string(),
            up,
            down,
        });
    }
    Ok(out)
}

pub struct Migrator {
    pool: Pool<Sqlite>,
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            migrations: builtin_migrations(),
        }
    }

    /// Add on-disk migrations. A missing directory is not an error.
    pub fn with_dir<P: AsRef<Path>>(mut self, dir: P) -> Result<Self> {
        if dir.as_ref().is_dir() {
            for m in load_dir(dir)? {
                if self.migrations.iter().any(|b| b.version == m.version) {
                    bail!("Duplicate migration version {}", m.version);
                }
                self.migrations.push(m);
            }
        }
        self.migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(self)
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                group_id INTEGER NOT NULL,
                applied_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create schema_migrations table")?;
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<(String, i64, String)>> {
        let rows = sqlx::query(
            "SELECT version, group_id, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read schema_migrations")?;
        Ok(rows
            .iter()
            .map(|r| (r.get("version"), r.get("group_id"), r.get("applied_at")))
            .collect())
    }

    /// Apply all pending migrations as one new group. Returns the applied ids.
    pub async fn migrate(&self) -> Result<Vec<String>> {
        self.init().await?;
        let applied = self.applied().await?;
        let group = applied.iter().map(|(_, g, _)| *g).max().unwrap_or(0) + 1;
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| !applied.iter().any(|(v, _, _)| *v == m.version))
            .collect();

        let mut done = Vec::new();
        for m in pending {
            let mut tx = self.pool.begin().await?;
            for stmt in statements(&m.up) {
                sqlx::query(stmt)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to apply migration {}", m.id()))?;
            }
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, group_id, applied_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&m.version)
            .bind(&m.name)
            .bind(group)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .context("Failed to record migration")?;
            tx.commit().await?;
            tracing::info!(migration = %m.id(), group, "Migration applied");
            done.push(m.id());
        }
        Ok(done)
    }

    /// Undo the most recent group. Returns the rolled-back ids, newest first.
    pub async fn rollback(&self) -> Result<Vec<String>> {
        self.init().await?;
        let applied = self.applied().await?;
        let Some(group) = applied.iter().map(|(_, g, _)| *g).max() else {
            return Ok(Vec::new());
        };
        let mut versions: Vec<&String> = applied
            .iter()
            .filter(|(_, g, _)| *g == group)
            .map(|(v, _, _)| v)
            .collect();
        versions.sort_by(|a, b| b.cmp(a));

        let mut done = Vec::new();
        for version in versions {
            let Some(m) = self.migrations.iter().find(|m| &m.version == version) else {
                bail!("Applied migration {} is not known to this binary", version);
            };
            let mut tx = self.pool.begin().await?;
            for stmt in statements(&m.down) {
                sqlx::query(stmt)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to roll back migration {}", m.id()))?;
            }
            sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
                .bind(&m.version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(migration = %m.id(), group, "Migration rolled back");
            done.push(m.id());
        }
        Ok(done)
    }

    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        self.init().await?;
        let applied = self.applied().await?;
        Ok(self
            .migrations
            .iter()
            .map(|m| {
                let hit = applied.iter().find(|(v, _, _)| *v == m.version);
                MigrationStatus {
                    version: m.version.clone(),
                    name: m.name.clone(),
                    group: hit.map(|(_, g, _)| *g),
                    applied_at: hit.map(|(_, _, a)| a.clone()),
                }
            })
            .collect())
    }

    /// Roll back every group, then migrate from scratch.
    pub async fn reset(&self) -> Result<Vec<String>> {
        loop {
            if self.rollback().await?.is_empty() {
                break;
            }
        }
        self.migrate().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Sql,
    Code,
}

impl std::str::FromStr for MigrationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sql" => Ok(MigrationKind::Sql),
            "code" | "rust" => Ok(MigrationKind::Code),
            other => bail!("unsupported migration type: {} (supported: sql, code)", other),
        }
    }
}

/// Write new migration file(s) into `dir` and return their paths.
///
/// `Sql` writes an up/down pair picked up by [`Migrator::with_dir`]. `Code`
/// writes a Rust snippet with a `Migration` entry to paste into
/// [`builtin_migrations`].
pub fn create_migration<P: AsRef<Path>>(dir: P, name: &str, kind: MigrationKind) -> Result<Vec<PathBuf>> {
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("migration name must be non-empty snake_case ASCII, got {:?}", name);
    }
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create migrations dir: {}", dir.display()))?;
    let version = Utc::now().format("%Y%m%d%H%M%S").to_string();

    let files = match kind {
        MigrationKind::Sql => vec![
            (
                dir.join(format!("{}_{}.up.sql", version, name)),
                format!("-- {}: migration up\n", name),
            ),
            (
                dir.join(format!("{}_{}.down.sql", version, name)),
                format!("-- {}: migration down\n", name),
            ),
        ],
        MigrationKind::Code => vec![(
            dir.join(format!("{}_{}.rs", version, name)),
            format!(
                "// Add to wavess_memory::migrations::builtin_migrations()\nMigration::builtin(\n    \"{}\",\n    \"{}\",\n    r#\"\n    -- up\n    \"#,\n    r#\"\n    -- down\n    \"#,\n),\n",
                version, name
            ),
        )],
    };
    for (path, body) in &files {
        if path.exists() {
            bail!("Migration file already exists: {}", path.display());
        }
        std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(files.into_iter().map(|(p, _)| p).collect())
}
