//! Loadable keyword tables for the classifiers and the emotion lexicon.
//!
//! The default table is compiled into the binary; deployments can point
//! `classifier.lexicon_path` at their own TOML file with the same layout.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::models::Mood;

const BUILTIN_LEXICONS: &str = include_str!("../data/lexicons.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Act,
    Body,
    Nudity,
    Context,
    Euphemism,
}

impl RuleCategory {
    /// Categories whose weight a suppression context may reduce.
    pub fn is_suppressible(&self) -> bool {
        matches!(
            self,
            RuleCategory::Body | RuleCategory::Nudity | RuleCategory::Context
        )
    }

    /// Categories that count as sexual for the minor-proximity check.
    pub fn is_sexual(&self) -> bool {
        matches!(
            self,
            RuleCategory::Act | RuleCategory::Body | RuleCategory::Nudity
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleGroup {
    pub category: RuleCategory,
    pub weight: u32,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardTriggerGroup {
    pub reason: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinorProximity {
    pub reason: String,
    pub window: usize,
    pub minor_terms: Vec<String>,
    pub sexual_terms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Suppression {
    pub context: String,
    pub reduce: u32,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentLexicon {
    pub rules: Vec<RuleGroup>,
    pub hard_triggers: Vec<HardTriggerGroup>,
    pub minor_proximity: MinorProximity,
    #[serde(default)]
    pub suppressions: Vec<Suppression>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationLexicon {
    pub exit_signals: Vec<String>,
    pub topic_changes: Vec<String>,
    pub implicit_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoodKeywords {
    pub mood: Mood,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmotionLexicon {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    #[serde(default)]
    pub moods: Vec<MoodKeywords>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Lexicon {
    pub content: ContentLexicon,
    pub conversation: ConversationLexicon,
    pub emotion: EmotionLexicon,
}

impl Lexicon {
    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_LEXICONS).context("Failed to parse built-in lexicon table")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read lexicon file: {}", path.as_ref().display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse lexicon file: {}", path.as_ref().display()))
    }

    /// Load from `path` if given, otherwise use the built-in table.
    pub fn load_or_builtin(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let lexicon: Lexicon = toml::from_str(raw)?;
        lexicon.validate()?;
        Ok(lexicon)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.content.rules.iter().any(|g| g.patterns.is_empty()) {
            return Err(ConfigError::InvalidLexicon(
                "content rule group without patterns".into(),
            ));
        }
        if self.content.minor_proximity.window == 0 {
            return Err(ConfigError::InvalidLexicon(
                "minor proximity window must be positive".into(),
            ));
        }
        if self.conversation.exit_signals.is_empty() {
            return Err(ConfigError::InvalidLexicon("exit signal list is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_parses() {
        let lex = Lexicon::builtin().unwrap();
        assert!(lex
            .content
            .rules
            .iter()
            .any(|g| g.category == RuleCategory::Act));
        assert!(lex.content.hard_triggers.iter().any(|g| g.reason == "rape"));
        assert_eq!(lex.content.minor_proximity.window, 30);
        assert!(lex.conversation.exit_signals.contains(&"算了".to_string()));
        assert!(lex.emotion.moods.iter().any(|m| m.mood == Mood::Shy));
    }

    #[test]
    fn test_rejects_empty_exit_list() {
        let raw = r#"
[[content.rules]]
category = "act"
weight = 8
patterns = ["x"]

[[content.hard_triggers]]
reason = "rape"
patterns = ["rape"]

[content.minor_proximity]
reason = "illegal_underage"
window = 30
minor_terms = ["minor"]
sexual_terms = []

[conversation]
exit_signals = []
topic_changes = []
implicit_patterns = []

[emotion]
positive = []
negative = []
"#;
        assert!(Lexicon::from_toml(raw).is_err());
    }

    #[test]
    fn test_suppressible_categories() {
        assert!(RuleCategory::Body.is_suppressible());
        assert!(!RuleCategory::Act.is_suppressible());
        assert!(!RuleCategory::Euphemism.is_suppressible());
    }
}
