//! Affection, mood and tier bookkeeping for a (user, character) bond.
//!
//! Everything except the snapshot timeline is a pure function of its inputs.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::lexicon::EmotionLexicon;
use crate::models::{
    EmotionData, EmotionHistoryEntry, EmotionSnapshot, IntimacyTier, Mood, Relationship,
    RelationshipTier,
};

pub const AFFECTION_MIN: i32 = 0;
pub const AFFECTION_MAX: i32 = 100;
pub const MILESTONE_THRESHOLDS: [u8; 5] = [20, 40, 60, 80, 100];
/// In-memory snapshots kept per (user, character).
pub const TIMELINE_CAP: usize = 100;
/// Bounds for the model-reported per-turn change.
pub const RETURNED_DELTA_LIMIT: i32 = 5;
/// Snapshot trigger for turns that changed tier or reached a threshold.
pub const MILESTONE_TRIGGER: &str = "milestone";
const MESSAGE_TRIGGER: &str = "message";

const LONG_MESSAGE_CHARS: usize = 50;

// ============================================================================
// Pure functions
// ============================================================================

pub fn relationship_for(affection: u8) -> RelationshipTier {
    match affection {
        90..=u8::MAX => RelationshipTier::DeepLove,
        80..=89 => RelationshipTier::Lover,
        70..=79 => RelationshipTier::Romantic,
        60..=69 => RelationshipTier::CloseFriend,
        40..=59 => RelationshipTier::Friend,
        20..=39 => RelationshipTier::Acquaintance,
        _ => RelationshipTier::Stranger,
    }
}

pub fn intimacy_for(affection: u8) -> IntimacyTier {
    match affection {
        90..=u8::MAX => IntimacyTier::DeeplyIntimate,
        70..=89 => IntimacyTier::Intimate,
        60..=69 => IntimacyTier::Close,
        40..=59 => IntimacyTier::Friendly,
        20..=39 => IntimacyTier::Polite,
        _ => IntimacyTier::Distant,
    }
}

/// Clamp to [0, 100], warning when the input was out of range.
pub fn clamp_affection(value: i32) -> u8 {
    if !(AFFECTION_MIN..=AFFECTION_MAX).contains(&value) {
        tracing::warn!(value, "Affection out of range, clamping");
    }
    value.clamp(AFFECTION_MIN, AFFECTION_MAX) as u8
}

/// Starting affection for a new bond: 25 + (char-count hash) mod 25.
pub fn initial_affection(user_id: &str, character_id: &str) -> u8 {
    let sum: u32 = user_id
        .chars()
        .chain(character_id.chars())
        .map(|c| c as u32)
        .fold(0u32, |acc, c| acc.wrapping_add(c));
    25 + (sum % 25) as u8
}

/// Merge the model-reported change with the locally computed one.
///
/// Magnitude is the smaller of the two; sign follows the local lexicon.
/// When the two disagree in sign the turn moves nothing.
pub fn combine_deltas(returned: Option<i32>, computed: i32) -> i32 {
    let Some(returned) = returned else {
        return computed;
    };
    let returned = returned.clamp(-RETURNED_DELTA_LIMIT, RETURNED_DELTA_LIMIT);
    if returned == 0 || computed == 0 {
        return 0;
    }
    if returned.signum() != computed.signum() {
        return 0;
    }
    computed.signum() * returned.abs().min(computed.abs())
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpecialEvent {
    AffectionMilestone {
        threshold: u8,
        description: String,
    },
    RelationshipChange {
        from: RelationshipTier,
        to: RelationshipTier,
        description: String,
    },
}

impl SpecialEvent {
    pub fn description(&self) -> &str {
        match self {
            SpecialEvent::AffectionMilestone { description, .. } => description,
            SpecialEvent::RelationshipChange { description, .. } => description,
        }
    }
}

fn milestone_description(threshold: u8) -> &'static str {
    match threshold {
        20 => "初步認識，開始有些好感",
        40 => "成為朋友，彼此信任",
        60 => "關係親密，特別在意",
        80 => "深深愛戀，無法分離",
        _ => "完美結合，靈魂伴侶",
    }
}

/// Result of applying one turn to a relationship.
#[derive(Debug, Clone)]
pub struct EmotionUpdate {
    pub relationship: Relationship,
    pub delta: i32,
    pub events: Vec<SpecialEvent>,
    /// Thresholds crossed this turn. They become events only once the store
    /// confirms the pair had not reached them before.
    pub milestones: Vec<u8>,
    pub snapshot: EmotionSnapshot,
}

impl EmotionUpdate {
    /// Turn the thresholds the store recorded for the first time into events.
    pub fn confirm_milestones(&mut self, confirmed: &[u8]) {
        for threshold in self.milestones.iter().filter(|t| confirmed.contains(t)) {
            self.events.push(SpecialEvent::AffectionMilestone {
                threshold: *threshold,
                description: milestone_description(*threshold).to_string(),
            });
        }
        if !self.events.is_empty() {
            self.snapshot.trigger_type = MILESTONE_TRIGGER.to_string();
        }
    }

    /// The single event reported back to the caller: a tier change beats a
    /// threshold crossing, higher thresholds beat lower ones.
    pub fn headline_event(&self) -> Option<SpecialEvent> {
        self.events
            .iter()
            .find(|e| matches!(e, SpecialEvent::RelationshipChange { .. }))
            .or_else(|| self.events.last())
            .cloned()
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct EmotionManager {
    positive: Vec<String>,
    negative: Vec<String>,
    moods: Vec<(Mood, Vec<String>)>,
    timelines: Mutex<HashMap<(String, String), VecDeque<EmotionSnapshot>>>,
}

impl EmotionManager {
    pub fn new(lexicon: &EmotionLexicon) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            positive: lower(&lexicon.positive),
            // Longer phrases first so that "不喜歡" masks before "喜歡" is seen.
            negative: {
                let mut n = lower(&lexicon.negative);
                n.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
                n
            },
            moods: lexicon
                .moods
                .iter()
                .map(|m| (m.mood, lower(&m.keywords)))
                .collect(),
            timelines: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh relationship row for a first turn.
    pub fn new_relationship(
        &self,
        user_id: &str,
        character_id: &str,
        chat_id: Option<&str>,
    ) -> Relationship {
        let affection = initial_affection(user_id, character_id);
        Relationship {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            chat_id: chat_id.map(str::to_string),
            affection,
            mood: Mood::Neutral,
            relationship: relationship_for(affection),
            intimacy: intimacy_for(affection),
            total_interactions: 0,
            emotion_data: EmotionData::default(),
            updated_at: Utc::now(),
        }
    }

    /// (positive hit, negative hit). Negative phrases are removed before the
    /// positive scan so "不喜歡" does not also count as "喜歡".
    fn sentiment_hits(&self, text: &str) -> (bool, bool) {
        let mut masked = text.to_lowercase();
        let mut negative = false;
        for w in &self.negative {
            if masked.contains(w.as_str()) {
                negative = true;
                masked = masked.replace(w.as_str(), " ");
            }
        }
        let positive = self.positive.iter().any(|w| masked.contains(w.as_str()));
        (positive, negative)
    }

    /// Locally computed affection change for one user utterance.
    pub fn compute_delta(&self, user_text: &str, level: u8) -> i32 {
        let (positive, negative) = self.sentiment_hits(user_text);
        let mut delta = 1;
        if positive {
            delta += 2;
        }
        if negative {
            delta -= 3;
        }
        if user_text.chars().count() > LONG_MESSAGE_CHARS {
            delta += 1;
        }
        delta += match level {
            2 | 3 => 1,
            4 | 5 => 2,
            _ => 0,
        };
        delta
    }

    /// Convenience wrapper: previous affection plus the local delta, clamped.
    pub fn update_affection(&self, user_text: &str, level: u8, previous: u8) -> u8 {
        clamp_affection(previous as i32 + self.compute_delta(user_text, level))
    }

    pub fn mood_for(&self, user_text: &str, level: u8, affection: u8) -> Mood {
        let text = user_text.to_lowercase();
        for (mood, keywords) in &self.moods {
            if keywords.iter().any(|k| text.contains(k.as_str())) {
                return *mood;
            }
        }
        match level {
            4 | 5 => return Mood::Passionate,
            2 | 3 => return Mood::Romantic,
            _ => {}
        }
        let (positive, negative) = self.sentiment_hits(user_text);
        if negative {
            return Mood::Concerned;
        }
        if positive {
            return Mood::Happy;
        }
        match affection {
            80..=u8::MAX => Mood::Loving,
            60..=79 => Mood::Pleased,
            40..=59 => Mood::Friendly,
            20..=39 => Mood::Polite,
            _ => Mood::Neutral,
        }
    }

    /// Apply one turn. `delta` is the already-combined change. A mood the
    /// model reported wins over the lexicon's guess.
    pub fn apply_turn(
        &self,
        current: &Relationship,
        user_text: &str,
        level: u8,
        delta: i32,
        reported_mood: Option<Mood>,
    ) -> EmotionUpdate {
        let before = current.affection;
        let after = clamp_affection(before as i32 + delta);
        let mood = reported_mood.unwrap_or_else(|| self.mood_for(user_text, level, after));
        let tier = relationship_for(after);

        let mut next = current.clone();
        next.affection = after;
        next.mood = mood;
        next.relationship = tier;
        next.intimacy = intimacy_for(after);
        next.total_interactions += 1;
        next.updated_at = Utc::now();

        let mut events = Vec::new();
        if tier != current.relationship {
            events.push(SpecialEvent::RelationshipChange {
                from: current.relationship,
                to: tier,
                description: format!(
                    "關係從「{}」變為「{}」",
                    current.relationship.display_name(),
                    tier.display_name()
                ),
            });
        }
        let milestones: Vec<u8> = MILESTONE_THRESHOLDS
            .into_iter()
            .filter(|t| before < *t && after >= *t)
            .collect();

        let context: String = user_text.chars().take(100).collect();
        next.emotion_data.push_history(EmotionHistoryEntry {
            timestamp: next.updated_at,
            trigger_type: MESSAGE_TRIGGER.to_string(),
            trigger_content: context.clone(),
            old_affection: before,
            new_affection: after,
            affection_change: after as i32 - before as i32,
            old_mood: current.mood,
            new_mood: mood,
        });

        let snapshot = EmotionSnapshot {
            user_id: current.user_id.clone(),
            character_id: current.character_id.clone(),
            chat_id: current.chat_id.clone(),
            trigger_type: if events.is_empty() {
                MESSAGE_TRIGGER.to_string()
            } else {
                MILESTONE_TRIGGER.to_string()
            },
            context,
            affection_before: before,
            affection_after: after,
            mood_before: current.mood,
            mood_after: mood,
            created_at: next.updated_at,
        };

        EmotionUpdate {
            relationship: next,
            delta: after as i32 - before as i32,
            events,
            milestones,
            snapshot,
        }
    }

    /// Append to the bounded in-memory timeline once the turn is durable.
    pub fn record_snapshot(&self, snapshot: EmotionSnapshot) {
        let key = (snapshot.user_id.clone(), snapshot.character_id.clone());
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        let ring = timelines.entry(key).or_default();
        if ring.len() >= TIMELINE_CAP {
            ring.pop_front();
        }
        ring.push_back(snapshot);
    }

    pub fn timeline(&self, user_id: &str, character_id: &str) -> Vec<EmotionSnapshot> {
        let timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        timelines
            .get(&(user_id.to_string(), character_id.to_string()))
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;

    fn manager() -> EmotionManager {
        EmotionManager::new(&Lexicon::builtin().unwrap().emotion)
    }

    #[test]
    fn test_affection_math() {
        let m = manager();
        assert_eq!(m.update_affection("我很喜歡你，謝謝", 1, 50), 53);
        assert_eq!(m.update_affection("我討厭你", 1, 50), 48);
        assert_eq!(m.update_affection("你好", 1, 50), 51);
    }

    #[test]
    fn test_negated_positive_is_negative_only() {
        let m = manager();
        assert_eq!(m.compute_delta("我不喜歡這樣", 1), -2);
    }

    #[test]
    fn test_level_and_length_bonus() {
        let m = manager();
        assert_eq!(m.compute_delta("嗯", 2), 2);
        assert_eq!(m.compute_delta("嗯", 5), 3);
        let long = "嗯".repeat(51);
        assert_eq!(m.compute_delta(&long, 1), 2);
    }

    #[test]
    fn test_clamped() {
        let m = manager();
        assert_eq!(m.update_affection("我很喜歡你", 5, 99), 100);
        assert_eq!(m.update_affection("我討厭你", 1, 1), 0);
        assert_eq!(clamp_affection(250), 100);
        assert_eq!(clamp_affection(-7), 0);
    }

    #[test]
    fn test_tier_table() {
        assert_eq!(relationship_for(0), RelationshipTier::Stranger);
        assert_eq!(relationship_for(19), RelationshipTier::Stranger);
        assert_eq!(relationship_for(20), RelationshipTier::Acquaintance);
        assert_eq!(relationship_for(59), RelationshipTier::Friend);
        assert_eq!(relationship_for(60), RelationshipTier::CloseFriend);
        assert_eq!(relationship_for(75), RelationshipTier::Romantic);
        assert_eq!(relationship_for(85), RelationshipTier::Lover);
        assert_eq!(relationship_for(90), RelationshipTier::DeepLove);
        assert_eq!(intimacy_for(75), IntimacyTier::Intimate);
        assert_eq!(intimacy_for(85), IntimacyTier::Intimate);
        assert_eq!(intimacy_for(100), IntimacyTier::DeeplyIntimate);
        assert_eq!(intimacy_for(39), IntimacyTier::Polite);
    }

    #[test]
    fn test_initial_affection_range() {
        for (u, c) in [("u1", "c1"), ("alice", "char_001"), ("", "")] {
            let a = initial_affection(u, c);
            assert!((25..50).contains(&a));
        }
        assert_eq!(initial_affection("u1", "c1"), initial_affection("u1", "c1"));
    }

    #[test]
    fn test_combine_deltas() {
        assert_eq!(combine_deltas(None, 3), 3);
        assert_eq!(combine_deltas(Some(5), 3), 3);
        assert_eq!(combine_deltas(Some(1), 3), 1);
        assert_eq!(combine_deltas(Some(-4), -2), -2);
        assert_eq!(combine_deltas(Some(3), -2), 0);
        assert_eq!(combine_deltas(Some(40), 4), 4);
        assert_eq!(combine_deltas(Some(0), 2), 0);
    }

    #[test]
    fn test_mood() {
        let m = manager();
        assert_eq!(m.mood_for("今天好開心", 1, 50), Mood::Happy);
        assert_eq!(m.mood_for("我有點害羞", 1, 50), Mood::Shy);
        assert_eq!(m.mood_for("嗯", 4, 50), Mood::Passionate);
        assert_eq!(m.mood_for("嗯", 2, 50), Mood::Romantic);
        assert_eq!(m.mood_for("我討厭下雨", 1, 50), Mood::Concerned);
        assert_eq!(m.mood_for("嗯", 1, 85), Mood::Loving);
        assert_eq!(m.mood_for("嗯", 1, 10), Mood::Neutral);
    }

    #[test]
    fn test_crossed_thresholds_wait_for_confirmation() {
        let m = manager();
        let mut rel = m.new_relationship("u", "c", Some("chat"));
        rel.affection = 38;
        rel.relationship = relationship_for(38);

        let mut up = m.apply_turn(&rel, "謝謝你", 1, 3, None);
        assert_eq!(up.relationship.affection, 41);
        assert_eq!(up.milestones, vec![40]);
        assert_eq!(up.events.len(), 1);
        assert_eq!(up.snapshot.trigger_type, MILESTONE_TRIGGER);
        up.confirm_milestones(&[40]);
        assert!(up
            .events
            .iter()
            .any(|e| matches!(e, SpecialEvent::AffectionMilestone { threshold: 40, .. })));
        assert!(matches!(
            up.headline_event(),
            Some(SpecialEvent::RelationshipChange { .. })
        ));
    }

    #[test]
    fn test_unconfirmed_threshold_is_not_an_event() {
        let m = manager();
        let mut rel = m.new_relationship("u", "c", Some("chat"));
        rel.affection = 98;
        rel.relationship = relationship_for(98);

        // 100 sits inside the top tier, so only the threshold can fire.
        let mut up = m.apply_turn(&rel, "嗯", 1, 3, None);
        assert_eq!(up.milestones, vec![100]);
        assert!(up.events.is_empty());
        up.confirm_milestones(&[]);
        assert!(up.headline_event().is_none());
        assert_eq!(up.snapshot.trigger_type, "message");

        let mut up = m.apply_turn(&rel, "嗯", 1, 3, None);
        up.confirm_milestones(&[100]);
        assert!(matches!(
            up.headline_event(),
            Some(SpecialEvent::AffectionMilestone { threshold: 100, .. })
        ));
        assert_eq!(up.snapshot.trigger_type, MILESTONE_TRIGGER);
    }

    #[test]
    fn test_reported_mood_wins() {
        let m = manager();
        let rel = m.new_relationship("u", "c", Some("chat"));
        let up = m.apply_turn(&rel, "今天好開心", 1, 1, Some(Mood::Shy));
        assert_eq!(up.relationship.mood, Mood::Shy);
        assert_eq!(up.snapshot.mood_after, Mood::Shy);
        let up = m.apply_turn(&rel, "今天好開心", 1, 1, None);
        assert_eq!(up.relationship.mood, Mood::Happy);
    }

    #[test]
    fn test_timeline_is_bounded() {
        let m = manager();
        let rel = m.new_relationship("u", "c", None);
        for _ in 0..(TIMELINE_CAP + 5) {
            let up = m.apply_turn(&rel, "嗯", 1, 1, None);
            m.record_snapshot(up.snapshot);
        }
        assert_eq!(m.timeline("u", "c").len(), TIMELINE_CAP);
        assert!(m.timeline("u", "other").is_empty());
    }
}
