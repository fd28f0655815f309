//! In-process TTL cache with cost-weighted admission and hit/miss counters.
//!
//! A miss is never an error: callers fall back to the store and re-admit.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use wavess_core::models::{Character, Relationship};

struct Entry<V> {
    value: V,
    cost: u64,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub entries: usize,
    pub cost: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct TtlCache<V> {
    map: DashMap<String, Entry<V>>,
    max_cost: u64,
    used: AtomicU64,
    counters: Counters,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_cost: u64) -> Self {
        Self {
            map: DashMap::new(),
            max_cost,
            used: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.map.get(key) {
            if !entry.expired(now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        // Expired entries are dropped lazily on read.
        if let Some((_, e)) = self.map.remove_if(key, |_, e| e.expired(now)) {
            self.release(e.cost);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Admit `value` at `cost`. Returns false if the entry can never fit.
    pub fn insert(&self, key: &str, value: V, cost: u64, ttl: Option<Duration>) -> bool {
        if cost > self.max_cost {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some((_, old)) = self.map.remove(key) {
            self.release(old.cost);
        }
        self.make_room(cost);
        self.map.insert(
            key.to_string(),
            Entry {
                value,
                cost,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        self.used.fetch_add(cost, Ordering::Relaxed);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn invalidate(&self, key: &str) {
        if let Some((_, e)) = self.map.remove(key) {
            self.release(e.cost);
        }
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let keys: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for k in keys {
            self.invalidate(&k);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            entries: self.map.len(),
            cost: self.used.load(Ordering::Relaxed),
        }
    }

    fn release(&self, cost: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| {
                Some(u.saturating_sub(cost))
            });
    }

    /// Drop expired entries, then the soonest-expiring ones, until `cost` fits.
    fn make_room(&self, cost: u64) {
        if self.used.load(Ordering::Relaxed) + cost <= self.max_cost {
            return;
        }
        let now = Instant::now();
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|e| e.expired(now))
            .map(|e| e.key().clone())
            .collect();
        for k in expired {
            self.invalidate(&k);
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }

        while self.used.load(Ordering::Relaxed) + cost > self.max_cost {
            // Entries without a TTL go last.
            let victim = self
                .map
                .iter()
                .min_by_key(|e| e.expires_at.map_or((1, now), |t| (0, t)))
                .map(|e| e.key().clone());
            match victim {
                Some(k) => {
                    self.invalidate(&k);
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

// ============================================================================
// Engine namespaces
// ============================================================================

pub fn character_key(id: &str) -> String {
    format!("character:{}", id)
}

pub fn relationship_key(user_id: &str, character_id: &str, chat_id: Option<&str>) -> String {
    format!(
        "relationship:{}:{}:{}",
        user_id,
        character_id,
        chat_id.unwrap_or("global")
    )
}

/// Character aggregates (no TTL, invalidated on update) and relationship
/// rows (short TTL, invalidated on write).
pub struct EngineCache {
    characters: TtlCache<Character>,
    relationships: TtlCache<Relationship>,
    relationship_ttl: Duration,
}

impl EngineCache {
    pub fn new(max_cost: u64, relationship_ttl: Duration) -> Self {
        Self {
            characters: TtlCache::new(max_cost),
            relationships: TtlCache::new(max_cost),
            relationship_ttl,
        }
    }

    pub fn get_character(&self, id: &str) -> Option<Character> {
        self.characters.get(&character_key(id))
    }

    pub fn put_character(&self, c: &Character) {
        let cost = 64 + c.user_description.len() as u64 + c.tags.len() as u64 * 16;
        self.characters.insert(&character_key(&c.id), c.clone(), cost, None);
    }

    pub fn invalidate_character(&self, id: &str) {
        self.characters.invalidate(&character_key(id));
    }

    pub fn get_relationship(
        &self,
        user_id: &str,
        character_id: &str,
        chat_id: Option<&str>,
    ) -> Option<Relationship> {
        self.relationships
            .get(&relationship_key(user_id, character_id, chat_id))
    }

    pub fn put_relationship(&self, r: &Relationship) {
        let cost = 256 + r.emotion_data.history.len() as u64 * 64;
        self.relationships.insert(
            &relationship_key(&r.user_id, &r.character_id, r.chat_id.as_deref()),
            r.clone(),
            cost,
            Some(self.relationship_ttl),
        );
    }

    pub fn invalidate_relationship(&self, user_id: &str, character_id: &str, chat_id: Option<&str>) {
        self.relationships
            .invalidate(&relationship_key(user_id, character_id, chat_id));
    }

    /// Drop every cached row for a (user, character) pair.
    pub fn invalidate_pair(&self, user_id: &str, character_id: &str) {
        self.relationships
            .invalidate_prefix(&format!("relationship:{}:{}:", user_id, character_id));
    }

    pub fn character_stats(&self) -> CacheStats {
        self.characters.stats()
    }

    pub fn relationship_stats(&self) -> CacheStats {
        self.relationships.stats()
    }
}
