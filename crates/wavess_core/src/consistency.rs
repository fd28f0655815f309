//! Character consistency scoring.
//!
//! A reply starts at 1.0 and loses `violation.weight * weights[type]` for each
//! violation found by the four checks. The result is advisory: the turn engine
//! logs it and never blocks a reply on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::models::{Character, CharacterType};

pub const CONSISTENT_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SpeakingStyle,
    Personality,
    Vocabulary,
    Behavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    pub severity: Severity,
    pub weight: f64,
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyWeights {
    pub speaking_style: f64,
    pub personality: f64,
    pub vocabulary: f64,
    pub behavior: f64,
}

impl Default for ConsistencyWeights {
    fn default() -> Self {
        Self {
            speaking_style: 0.25,
            personality: 0.30,
            vocabulary: 0.20,
            behavior: 0.25,
        }
    }
}

impl ConsistencyWeights {
    fn get(&self, kind: ViolationKind) -> f64 {
        match kind {
            ViolationKind::SpeakingStyle => self.speaking_style,
            ViolationKind::Personality => self.personality,
            ViolationKind::Vocabulary => self.vocabulary,
            ViolationKind::Behavior => self.behavior,
        }
    }
}

/// Static description of how a character is expected to speak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitSheet {
    pub character_id: String,
    pub name: String,
    pub archetype: CharacterType,
    pub personality: Vec<String>,
    pub speaking_style: Vec<String>,
    pub vocabularies: Vec<String>,
    pub restrictions: Vec<String>,
    pub weights: ConsistencyWeights,
}

impl TraitSheet {
    /// Default sheet for a character, driven by its archetype and tags.
    pub fn for_character(character: &Character) -> Self {
        let mut weights = ConsistencyWeights::default();
        let (style, vocab, restrictions): (&[&str], &[&str], &[&str]) =
            match character.character_type {
                CharacterType::Dominant => (
                    &["簡潔有力", "命令式語氣"],
                    &["我的", "靠近", "命令", "掌控"],
                    &["不會過度示弱", "不會使用可愛語氣"],
                ),
                CharacterType::Gentle => {
                    weights.speaking_style = 0.30;
                    (
                        &["溫和語調", "專業分析"],
                        &["理解", "溫柔", "觀察"],
                        &["不會粗俗", "保持專業界線"],
                    )
                }
                CharacterType::Playful => (
                    &["活潑有趣", "熱情表達"],
                    &["開心", "陽光", "溫暖"],
                    &["不會冷漠", "保持陽光正面"],
                ),
                CharacterType::Mystery | CharacterType::Reliable => (
                    &["自然對話"],
                    &["理解", "溫暖"],
                    &["保持角色一致性"],
                ),
            };
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            character_id: character.id.clone(),
            name: character.name.clone(),
            archetype: character.character_type,
            personality: character.tags.clone(),
            speaking_style: owned(style),
            vocabularies: owned(vocab),
            restrictions: owned(restrictions),
            weights,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub character_id: String,
    pub is_consistent: bool,
    pub score: f64,
    pub violations: Vec<Violation>,
    pub suggestions: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

// ============================================================================
// Archetype checks
// ============================================================================

struct ArchetypeRules {
    /// Replies longer than this (chars) read as rambling.
    max_chars: Option<usize>,
    forbidden_style: &'static [&'static str],
    forbidden_style_label: &'static str,
    expected_tone: &'static [&'static str],
    required_cues: &'static [&'static str],
    forbidden_personality: &'static [&'static str],
    style_tips: &'static [&'static str],
    personality_tips: &'static [&'static str],
    vocabulary_tip: &'static str,
}

const DOMINANT: ArchetypeRules = ArchetypeRules {
    max_chars: Some(200),
    forbidden_style: &["不好意思", "對不起", "請原諒", "我可能", "也許"],
    forbidden_style_label: "過於謙遜",
    expected_tone: &[],
    required_cues: &["我的", "靠近", "命令", "盯著", "佔有", "掌握"],
    forbidden_personality: &[],
    style_tips: &["保持簡潔有力的語言風格，避免冗長描述", "使用更多命令式和肯定式語氣"],
    personality_tips: &["增加掌控慾和保護慾的表達", "體現霸道的威嚴感和支配性"],
    vocabulary_tip: "多使用「我的」、「靠近」、「命令」等特徵詞彙",
};

const GENTLE: ArchetypeRules = ArchetypeRules {
    max_chars: None,
    forbidden_style: &["閉嘴", "滾", "粗俗"],
    forbidden_style_label: "粗暴",
    expected_tone: &["觀察", "理解", "情感", "專業", "溫柔", "親密"],
    required_cues: &["溫柔", "凝視", "理解", "專業", "深層", "內斂"],
    forbidden_personality: &["強烈", "激烈", "猛烈", "瘋狂", "情緒失控"],
    style_tips: &["保持溫和專業的語言風格", "增加專業分析和理解相關的表達"],
    personality_tips: &["強化溫柔專業的性格特點", "避免過於激進或情緒失控的表達"],
    vocabulary_tip: "多使用「觀察」、「理解」、「溫柔」等特徵詞彙",
};

const PLAYFUL: ArchetypeRules = ArchetypeRules {
    max_chars: None,
    forbidden_style: &["冷漠", "距離感", "壓抑"],
    forbidden_style_label: "冷漠",
    expected_tone: &["開心", "熱情", "陽光", "溫暖", "音樂", "親暱"],
    required_cues: &["熱情", "開朗", "親切", "活潑", "陽光", "溫暖"],
    forbidden_personality: &["冷漠", "壓抑", "距離感"],
    style_tips: &["保持活潑陽光的語言風格", "增加熱情的表達"],
    personality_tips: &["強化熱情開朗的性格特點", "避免過於冷漠或距離感的表達"],
    vocabulary_tip: "多使用「開心」、「陽光」、「溫暖」等特徵詞彙",
};

fn rules_for(archetype: CharacterType) -> Option<&'static ArchetypeRules> {
    match archetype {
        CharacterType::Dominant => Some(&DOMINANT),
        CharacterType::Gentle => Some(&GENTLE),
        CharacterType::Playful => Some(&PLAYFUL),
        CharacterType::Mystery | CharacterType::Reliable => None,
    }
}

/// Patterns that break a named restriction.
fn restriction_patterns(restriction: &str) -> &'static [&'static str] {
    match restriction {
        "不會過度示弱" => &["我很弱", "我不行", "我做不到", "我很笨"],
        "不會使用可愛語氣" => &["喵", "嘻嘻", "嘿嘿", "啦啦"],
        "不會過於霸道" => &["必須聽我", "不准反抗", "絕對服從"],
        "不會粗俗" => &["靠北", "幹你"],
        "不會冷漠" => &["隨便你", "與我無關", "不關我的事"],
        _ => &[],
    }
}

const TONE_MIN_CHARS: usize = 50;
const PERSONALITY_MIN_CHARS: usize = 100;
const VOCAB_MIN_CHARS: usize = 80;

// ============================================================================
// Checker
// ============================================================================

pub struct ConsistencyChecker {
    sheets: RwLock<HashMap<String, TraitSheet>>,
}

impl Default for ConsistencyChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self {
            sheets: RwLock::new(HashMap::new()),
        }
    }

    /// Build sheets for every character known at startup.
    pub fn with_characters<'a>(characters: impl IntoIterator<Item = &'a Character>) -> Self {
        let checker = Self::new();
        for c in characters {
            checker.update_traits(TraitSheet::for_character(c));
        }
        checker
    }

    pub fn update_traits(&self, sheet: TraitSheet) {
        tracing::debug!(character_id = %sheet.character_id, "Trait sheet loaded");
        if let Ok(mut sheets) = self.sheets.write() {
            sheets.insert(sheet.character_id.clone(), sheet);
        }
    }

    pub fn traits(&self, character_id: &str) -> Option<TraitSheet> {
        self.sheets
            .read()
            .ok()
            .and_then(|s| s.get(character_id).cloned())
    }

    /// Score a reply, registering a default sheet for unseen characters.
    pub fn check_character(&self, character: &Character, reply: &str) -> ConsistencyReport {
        if self.traits(&character.id).is_none() {
            self.update_traits(TraitSheet::for_character(character));
        }
        self.check(&character.id, reply)
    }

    pub fn check(&self, character_id: &str, reply: &str) -> ConsistencyReport {
        let Some(sheet) = self.traits(character_id) else {
            return ConsistencyReport {
                character_id: character_id.to_string(),
                is_consistent: true,
                score: 1.0,
                violations: Vec::new(),
                suggestions: Vec::new(),
                checked_at: Utc::now(),
            };
        };

        let mut violations = Vec::new();
        violations.extend(check_style(&sheet, reply));
        violations.extend(check_personality(&sheet, reply));
        violations.extend(check_vocabulary(&sheet, reply));
        violations.extend(check_behavior(&sheet, reply));

        let score = violations
            .iter()
            .fold(1.0, |s, v| s - v.weight * sheet.weights.get(v.kind))
            .max(0.0);
        let report = ConsistencyReport {
            character_id: character_id.to_string(),
            is_consistent: score >= CONSISTENT_THRESHOLD,
            score,
            suggestions: suggestions(&sheet, &violations),
            violations,
            checked_at: Utc::now(),
        };
        tracing::debug!(
            character_id,
            score = report.score,
            consistent = report.is_consistent,
            violations = report.violations.len(),
            "Consistency check finished"
        );
        report
    }
}

fn first_hit<'a>(patterns: &'a [&'a str], text: &str) -> Option<&'a str> {
    patterns.iter().copied().find(|p| text.contains(p))
}

fn check_style(sheet: &TraitSheet, reply: &str) -> Vec<Violation> {
    let Some(rules) = rules_for(sheet.archetype) else {
        return Vec::new();
    };
    let len = reply.chars().count();
    let mut out = Vec::new();
    if let Some(max) = rules.max_chars {
        if len > max {
            out.push(Violation {
                kind: ViolationKind::SpeakingStyle,
                description: "回應過於冗長，不符合簡潔有力的風格".into(),
                severity: Severity::Medium,
                weight: 0.3,
                context: format!("回應長度: {} 字符", len),
            });
        }
    }
    for p in rules.forbidden_style.iter().filter(|p| reply.contains(**p)) {
        out.push(Violation {
            kind: ViolationKind::SpeakingStyle,
            description: format!("使用了{}的語言，不符合角色風格", rules.forbidden_style_label),
            severity: Severity::High,
            weight: 0.4,
            context: format!("檢測到用詞: {}", p),
        });
    }
    if !rules.expected_tone.is_empty()
        && len > TONE_MIN_CHARS
        && first_hit(rules.expected_tone, reply).is_none()
    {
        out.push(Violation {
            kind: ViolationKind::SpeakingStyle,
            description: "較長回應中缺乏角色語氣元素".into(),
            severity: Severity::Low,
            weight: 0.2,
            context: "未檢測到語氣用詞".into(),
        });
    }
    out
}

fn check_personality(sheet: &TraitSheet, reply: &str) -> Vec<Violation> {
    let Some(rules) = rules_for(sheet.archetype) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    if reply.chars().count() > PERSONALITY_MIN_CHARS && first_hit(rules.required_cues, reply).is_none()
    {
        out.push(Violation {
            kind: ViolationKind::Personality,
            description: format!("回應中缺乏{}性格的體現", sheet.archetype.display_name()),
            severity: Severity::Medium,
            weight: 0.3,
            context: "較長回應未體現角色特質".into(),
        });
    }
    for p in rules.forbidden_personality.iter().filter(|p| reply.contains(**p)) {
        out.push(Violation {
            kind: ViolationKind::Personality,
            description: "使用了與角色性格相衝突的描述".into(),
            severity: Severity::Medium,
            weight: 0.4,
            context: format!("檢測到用詞: {}", p),
        });
    }
    out
}

fn check_vocabulary(sheet: &TraitSheet, reply: &str) -> Vec<Violation> {
    let len = reply.chars().count();
    let hits = sheet
        .vocabularies
        .iter()
        .filter(|v| reply.contains(v.as_str()))
        .count();
    if len > VOCAB_MIN_CHARS && hits == 0 {
        vec![Violation {
            kind: ViolationKind::Vocabulary,
            description: "回應中缺乏角色特徵詞彙".into(),
            severity: Severity::Low,
            weight: 0.2,
            context: format!("回應長度 {} 字符，特徵詞彙數量: {}", len, hits),
        }]
    } else {
        Vec::new()
    }
}

fn check_behavior(sheet: &TraitSheet, reply: &str) -> Vec<Violation> {
    sheet
        .restrictions
        .iter()
        .filter(|r| first_hit(restriction_patterns(r), reply).is_some())
        .map(|r| Violation {
            kind: ViolationKind::Behavior,
            description: format!("違反角色行為限制: {}", r),
            severity: Severity::High,
            weight: 0.5,
            context: r.clone(),
        })
        .collect()
}

fn suggestions(sheet: &TraitSheet, violations: &[Violation]) -> Vec<String> {
    if violations.is_empty() {
        return vec!["角色表現一致，無需改進".to_string()];
    }
    let kinds: BTreeSet<ViolationKind> = violations.iter().map(|v| v.kind).collect();
    let mut out = Vec::new();
    if let Some(rules) = rules_for(sheet.archetype) {
        if kinds.contains(&ViolationKind::SpeakingStyle) {
            out.extend(rules.style_tips.iter().map(|s| s.to_string()));
        }
        if kinds.contains(&ViolationKind::Personality) {
            out.extend(rules.personality_tips.iter().map(|s| s.to_string()));
        }
        if kinds.contains(&ViolationKind::Vocabulary) {
            out.push(rules.vocabulary_tip.to_string());
        }
    }
    if kinds.contains(&ViolationKind::Behavior) {
        out.push("注意遵守角色行為限制，避免出戲".to_string());
    }
    out
}
