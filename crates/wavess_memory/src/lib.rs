pub mod cache;
pub mod fixtures;
pub mod manager;
pub mod migrations;
pub mod sqlite;

pub use cache::{CacheStats, EngineCache, TtlCache};
pub use manager::{MemoryManager, MemoryUpdate};
pub use migrations::{Migration, MigrationKind, Migrator};
pub use sqlite::SqliteStore;

#[cfg(test)]
mod tests;
