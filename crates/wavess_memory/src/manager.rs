//! Two-tier conversation memory.
//!
//! Short-term memory is a per-chat ring of summarized turns held in process.
//! Long-term memory is a per (user, character) record distilled from user text
//! by a deterministic pattern scan, persisted on the global relationship row.
//!
//! Updates are split in two: `prepare` computes everything a turn will write
//! without touching shared state, and `apply` folds the short-term part in
//! once the turn has committed. A rolled-back turn leaves memory untouched.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

use wavess_core::config::MemoryConfig;
use wavess_core::memory::{
    Dislike, LongTermMemory, MessageSummary, Milestone, Nickname, Preference, ShortTermMemory,
    MAX_DISLIKES, MAX_MILESTONES, MAX_NICKNAMES, MAX_PREFERENCES, PERSONAL_INFO_MAX_LEVEL,
};
use wavess_core::models::{Message, Role};

const SUMMARY_MAX_CHARS: usize = 100;
const KEYWORDS_PER_SUMMARY: usize = 3;
const EXTRACT_MAX_CHARS: usize = 50;
const PERSONAL_INFO_MAX_CHARS: usize = 100;

// ============================================================================
// Word tables
// ============================================================================

const EMOTION_WORDS: &[(&str, &[&str])] = &[
    ("happy", &["開心", "高興", "快樂"]),
    ("sad", &["難過", "傷心", "痛苦"]),
    ("angry", &["生氣", "憤怒", "煩"]),
    ("shy", &["害羞", "臉紅", "不好意思"]),
    ("excited", &["興奮", "激動", "期待"]),
    ("worried", &["擔心", "緊張", "焦慮"]),
];

const IMPORTANT_WORDS: &[&str] = &[
    "喜歡", "愛", "想念", "關心", "擔心", "害怕", "生日", "紀念日", "約會", "工作", "家人",
    "朋友", "累", "開心", "難過", "生氣", "興奮", "緊張",
];

const TOPICS: &[(&str, &[&str])] = &[
    ("情感表達", &["喜歡", "愛", "想念", "關心"]),
    ("情緒狀態", &["開心", "難過", "生氣", "興奮", "緊張", "累"]),
    ("重要日子", &["生日", "紀念日", "約會"]),
    ("生活工作", &["工作", "家人", "朋友"]),
];

const IDLE_TOPIC: &str = "閒聊";
const FALLBACK_TOPIC: &str = "日常對話";

const PREFERENCE_TEMPLATES: &[(&str, &str)] = &[
    ("我最喜歡", "strong_preference"),
    ("我喜歡", "preference"),
    ("我愛", "preference"),
    ("我希望", "wish"),
    ("我想要", "desire"),
];

const EMPHASIS_WORDS: &[&str] = &["非常", "特別", "超級", "最", "一直", "永遠"];
const FEELING_WORDS: &[&str] = &["愛", "喜歡", "討厭", "害怕"];

const NICKNAMES: &[&str] = &["寶貝", "乖", "小傻瓜", "親愛的", "小可愛"];

const MILESTONE_TRIGGERS: &[(&str, &str)] = &[
    ("第一次", "first_time"),
    ("告白", "confession"),
    ("在一起", "together"),
    ("我愛你", "love_declaration"),
    ("想見你", "miss_you"),
    ("約會", "date"),
];

const DISLIKE_TRIGGERS: &[&str] = &["我不喜歡", "我討厭", "不要", "別", "我害怕", "我不想"];
const DISLIKE_SEVERITY: u8 = 3;

const PERSONAL_INFO_TRIGGERS: &[(&str, &[&str])] = &[
    ("birthday", &["我的生日", "生日是"]),
    ("age", &["我今年", "歲"]),
    ("occupation", &["我是", "我的工作", "職業"]),
    ("hobby", &["我的愛好", "我喜歡"]),
];

// ============================================================================
// Summaries
// ============================================================================

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn take_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub fn detect_emotion(text: &str) -> &'static str {
    EMOTION_WORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(label, _)| *label)
        .unwrap_or("neutral")
}

pub fn extract_keywords(text: &str) -> Vec<String> {
    IMPORTANT_WORDS
        .iter()
        .filter(|w| text.contains(*w))
        .take(KEYWORDS_PER_SUMMARY)
        .map(|w| w.to_string())
        .collect()
}

/// Topic label for the most recent entry's keywords.
pub fn topic_for(keywords: &[String]) -> String {
    if keywords.is_empty() {
        return IDLE_TOPIC.to_string();
    }
    keywords
        .iter()
        .find_map(|k| {
            TOPICS
                .iter()
                .find(|(_, words)| words.contains(&k.as_str()))
                .map(|(label, _)| label.to_string())
        })
        .unwrap_or_else(|| FALLBACK_TOPIC.to_string())
}

pub fn summarize(role: Role, content: &str, level: u8, timestamp: DateTime<Utc>) -> MessageSummary {
    MessageSummary {
        role,
        summary: truncate_chars(content.trim(), SUMMARY_MAX_CHARS),
        emotion: detect_emotion(content).to_string(),
        keywords: extract_keywords(content),
        level,
        timestamp,
    }
}

fn push_summary(stm: &mut ShortTermMemory, summary: MessageSummary, capacity: usize) {
    while stm.entries.len() >= capacity.max(1) {
        stm.entries.pop_front();
    }
    stm.current_topic = topic_for(&summary.keywords);
    stm.last_updated = summary.timestamp;
    stm.entries.push_back(summary);
}

// ============================================================================
// Long-term extraction
// ============================================================================

fn near_duplicate(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

fn preference_importance(text: &str) -> u8 {
    let mut importance = 2u8;
    if EMPHASIS_WORDS.iter().any(|w| text.contains(w)) {
        importance += 1;
    }
    if FEELING_WORDS.iter().any(|w| text.contains(w)) {
        importance += 1;
    }
    importance.min(5)
}

fn extract_preferences(found: &mut LongTermMemory, text: &str, level: u8, now: DateTime<Utc>) {
    for (template, category) in PREFERENCE_TEMPLATES {
        let Some(idx) = text.find(template) else {
            continue;
        };
        let content = take_chars(&text[idx..], EXTRACT_MAX_CHARS);
        if found
            .preferences
            .iter()
            .any(|p| near_duplicate(&p.content, &content))
        {
            continue;
        }
        found.preferences.push(Preference {
            category: category.to_string(),
            content,
            importance: preference_importance(text),
            level,
            created_at: now,
        });
    }
}

fn extract_nicknames(found: &mut LongTermMemory, assistant_text: &str, now: DateTime<Utc>) {
    for nick in NICKNAMES.iter().filter(|n| assistant_text.contains(*n)) {
        found.nicknames.push(Nickname {
            nickname: nick.to_string(),
            frequency: 1,
            last_used: now,
        });
    }
}

fn extract_milestones(
    found: &mut LongTermMemory,
    user_text: &str,
    assistant_text: &str,
    affection: u8,
    level: u8,
    now: DateTime<Utc>,
) {
    for (keyword, kind) in MILESTONE_TRIGGERS {
        if user_text.contains(keyword) || assistant_text.contains(keyword) {
            found.milestones.push(Milestone {
                kind: kind.to_string(),
                description: format!("達成里程碑：{}", keyword),
                affection,
                level,
                created_at: now,
            });
        }
    }
}

fn extract_dislikes(found: &mut LongTermMemory, text: &str, level: u8, now: DateTime<Utc>) {
    for trigger in DISLIKE_TRIGGERS {
        let Some(idx) = text.find(trigger) else {
            continue;
        };
        let topic = take_chars(&text[idx..], EXTRACT_MAX_CHARS);
        if found.dislikes.iter().any(|d| near_duplicate(&d.topic, &topic)) {
            continue;
        }
        found.dislikes.push(Dislike {
            topic,
            severity: DISLIKE_SEVERITY,
            evidence: take_chars(text, PERSONAL_INFO_MAX_CHARS),
            level,
            created_at: now,
        });
    }
}

fn extract_personal_info(found: &mut LongTermMemory, text: &str, level: u8) {
    if level > PERSONAL_INFO_MAX_LEVEL {
        return;
    }
    for (key, triggers) in PERSONAL_INFO_TRIGGERS {
        if triggers.iter().any(|t| text.contains(t)) {
            found
                .personal_info
                .insert(key.to_string(), take_chars(text, PERSONAL_INFO_MAX_CHARS));
        }
    }
}

/// Keep each list within its cap, evicting the oldest entries.
pub fn enforce_bounds(ltm: &mut LongTermMemory) {
    fn keep_newest<T, K: Ord>(list: &mut Vec<T>, cap: usize, key: impl Fn(&T) -> K) {
        if list.len() <= cap {
            return;
        }
        // Stable: equal timestamps keep insertion order.
        list.sort_by_key(|item| key(item));
        let overflow = list.len() - cap;
        list.drain(..overflow);
    }

    keep_newest(&mut ltm.preferences, MAX_PREFERENCES, |p| p.created_at);
    keep_newest(&mut ltm.milestones, MAX_MILESTONES, |m| m.created_at);
    keep_newest(&mut ltm.nicknames, MAX_NICKNAMES, |n| n.last_used);
    keep_newest(&mut ltm.dislikes, MAX_DISLIKES, |d| d.created_at);
}

/// Facts found in one turn, tagged with the turn's content level. Nothing is
/// deduplicated against stored memory yet; see [`merge_long_term`].
pub fn extract_turn(
    user_id: &str,
    character_id: &str,
    user_text: &str,
    assistant_text: &str,
    level: u8,
    affection: u8,
    now: DateTime<Utc>,
) -> LongTermMemory {
    let mut found = LongTermMemory::new(user_id, character_id);
    extract_preferences(&mut found, user_text, level, now);
    extract_nicknames(&mut found, assistant_text, now);
    extract_milestones(&mut found, user_text, assistant_text, affection, level, now);
    extract_dislikes(&mut found, user_text, level, now);
    extract_personal_info(&mut found, user_text, level);
    if !found.is_empty() {
        found.last_updated = Some(now);
    }
    found
}

/// Fold one turn's findings into stored memory. Near-duplicate preferences
/// and dislikes are skipped, nickname counts add up, and the first milestone
/// of a kind and the first value of a personal-info key win. Returns true if
/// `target` changed.
pub fn merge_long_term(target: &mut LongTermMemory, additions: &LongTermMemory) -> bool {
    let mut changes = 0;
    for p in &additions.preferences {
        if !target
            .preferences
            .iter()
            .any(|e| near_duplicate(&e.content, &p.content))
        {
            target.preferences.push(p.clone());
            changes += 1;
        }
    }
    for n in &additions.nicknames {
        match target.nicknames.iter_mut().find(|e| e.nickname == n.nickname) {
            Some(existing) => {
                existing.frequency += n.frequency;
                existing.last_used = existing.last_used.max(n.last_used);
            }
            None => target.nicknames.push(n.clone()),
        }
        changes += 1;
    }
    for m in &additions.milestones {
        if !target.milestones.iter().any(|e| e.kind == m.kind) {
            target.milestones.push(m.clone());
            changes += 1;
        }
    }
    for d in &additions.dislikes {
        if !target.dislikes.iter().any(|e| near_duplicate(&e.topic, &d.topic)) {
            target.dislikes.push(d.clone());
            changes += 1;
        }
    }
    for (key, value) in &additions.personal_info {
        if !target.personal_info.contains_key(key) {
            target.personal_info.insert(key.clone(), value.clone());
            changes += 1;
        }
    }

    if changes > 0 {
        enforce_bounds(target);
        target.last_updated = target.last_updated.max(additions.last_updated);
    }
    changes > 0
}

/// Scan one turn into `ltm`. Returns true if anything changed.
pub fn extract_long_term(
    ltm: &mut LongTermMemory,
    user_text: &str,
    assistant_text: &str,
    level: u8,
    affection: u8,
    now: DateTime<Utc>,
) -> bool {
    let found = extract_turn(
        &ltm.user_id,
        &ltm.character_id,
        user_text,
        assistant_text,
        level,
        affection,
        now,
    );
    merge_long_term(ltm, &found)
}

// ============================================================================
// Manager
// ============================================================================

/// Everything a turn will write to memory, computed before commit.
#[derive(Debug, Clone)]
pub struct MemoryUpdate {
    pub chat_id: String,
    pub summaries: Vec<MessageSummary>,
    /// This turn's findings. The store merges them into the current row.
    pub additions: LongTermMemory,
    /// Loaded memory with `additions` merged in.
    pub long_term: LongTermMemory,
    pub long_term_changed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub chats: usize,
    pub entries: usize,
}

pub struct MemoryManager {
    short_term: DashMap<String, ShortTermMemory>,
    capacity: usize,
    max_age: Duration,
}

impl MemoryManager {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            short_term: DashMap::new(),
            capacity: config.short_term_capacity.max(1),
            max_age: Duration::hours(config.short_term_max_age_hours),
        }
    }

    pub fn short_term(&self, chat_id: &str) -> Option<ShortTermMemory> {
        self.short_term.get(chat_id).map(|s| s.clone())
    }

    /// Rebuild a chat's ring from stored history if it is not in memory yet
    /// (first turn after a restart or after a sweep).
    pub fn seed_from_history(&self, chat_id: &str, history: &[Message]) {
        if history.is_empty() || self.short_term.contains_key(chat_id) {
            return;
        }
        let mut stm = ShortTermMemory::new(chat_id);
        let start = history.len().saturating_sub(self.capacity);
        for m in &history[start..] {
            push_summary(&mut stm, summarize(m.role, &m.content, m.nsfw_level, m.created_at), self.capacity);
        }
        debug!(chat_id, entries = stm.entries.len(), "Seeded short-term memory");
        self.short_term.entry(chat_id.to_string()).or_insert(stm);
    }

    /// Compute the turn's memory writes without mutating anything.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &self,
        chat_id: &str,
        user_id: &str,
        character_id: &str,
        long_term: Option<&LongTermMemory>,
        user_text: &str,
        assistant_text: &str,
        level: u8,
        affection: u8,
        now: DateTime<Utc>,
    ) -> MemoryUpdate {
        let additions = extract_turn(
            user_id,
            character_id,
            user_text,
            assistant_text,
            level,
            affection,
            now,
        );
        let mut ltm = long_term
            .cloned()
            .unwrap_or_else(|| LongTermMemory::new(user_id, character_id));
        let long_term_changed = merge_long_term(&mut ltm, &additions);

        MemoryUpdate {
            chat_id: chat_id.to_string(),
            summaries: vec![
                summarize(Role::User, user_text, level, now),
                summarize(Role::Assistant, assistant_text, level, now),
            ],
            additions,
            long_term: ltm,
            long_term_changed,
        }
    }

    /// Fold a committed turn into the short-term ring.
    pub fn apply(&self, update: &MemoryUpdate) {
        let mut stm = self
            .short_term
            .entry(update.chat_id.clone())
            .or_insert_with(|| ShortTermMemory::new(&update.chat_id));
        for s in &update.summaries {
            push_summary(&mut stm, s.clone(), self.capacity);
        }
    }

    pub fn clear(&self, chat_id: &str) {
        self.short_term.remove(chat_id);
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.short_term.contains_key(chat_id)
    }

    /// Text block injected into the prompt's context message. Long-term
    /// entries and recent-context entries above `max_level` are left out.
    pub fn memory_prompt(
        &self,
        chat_id: &str,
        long_term: Option<&LongTermMemory>,
        max_level: u8,
    ) -> String {
        let mut out = String::from("# Long-Term Memory (summary)\n");

        if let Some(ltm) = long_term {
            // Most important first, newest first among equals.
            let mut prefs: Vec<&Preference> = ltm
                .preferences
                .iter()
                .filter(|p| p.level <= max_level)
                .collect();
            prefs.sort_by(|a, b| {
                b.importance
                    .cmp(&a.importance)
                    .then(b.created_at.cmp(&a.created_at))
            });
            if !prefs.is_empty() {
                let prefs: Vec<&str> = prefs.iter().take(3).map(|p| p.content.as_str()).collect();
                out.push_str(&format!("- 偏好：{}\n", prefs.join("、")));
            }

            let ms: Vec<&str> = ltm
                .milestones
                .iter()
                .rev()
                .filter(|m| m.level <= max_level)
                .take(2)
                .map(|m| m.description.as_str())
                .collect();
            if !ms.is_empty() {
                out.push_str(&format!("- 里程碑：{}\n", ms.join("；")));
            }

            let ds: Vec<&str> = ltm
                .dislikes
                .iter()
                .rev()
                .filter(|d| d.level <= max_level)
                .take(2)
                .map(|d| d.topic.as_str())
                .collect();
            if !ds.is_empty() {
                out.push_str(&format!("- 禁忌：{}\n", ds.join("、")));
            }
        }

        if let Some(stm) = self.short_term.get(chat_id) {
            if !stm.entries.is_empty() {
                out.push_str("\n# Recent Context (last 3-5 turns)\n");
                for e in stm.entries.iter().filter(|e| e.level <= max_level) {
                    out.push_str(&format!("- {}\n", e.summary));
                }
                if !stm.current_topic.is_empty() {
                    out.push_str(&format!("- 當前話題：{}\n", stm.current_topic));
                }
            }
        }

        out
    }

    /// Drop rings untouched for longer than the configured age. Returns the
    /// swept chat ids.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Vec<String> {
        let max_age = self.max_age;
        let mut removed = Vec::new();
        self.short_term.retain(|chat_id, stm| {
            let keep = now.signed_duration_since(stm.last_updated) <= max_age;
            if !keep {
                removed.push(chat_id.clone());
            }
            keep
        });
        if !removed.is_empty() {
            info!(removed = removed.len(), "Swept stale short-term memory");
        }
        removed
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            chats: self.short_term.len(),
            entries: self.short_term.iter().map(|s| s.entries.len()).sum(),
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(&MemoryConfig::default())
    }
}
