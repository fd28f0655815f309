//! Keyword-weighted content classifier.
//!
//! Assigns one of five levels (L1 safe .. L5 explicit) to an utterance.
//! Rules are compiled once from the lexicon table; classification is a pure
//! function of the input text.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::lexicon::{ContentLexicon, RuleCategory};

const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

const DELEET: &[(&str, &str)] = &[
    ("seggs", "sex"),
    ("s3x", "sex"),
    ("s*x", "sex"),
    ("pr0n", "porn"),
    ("p0rn", "porn"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub level: u8,
    pub confidence: f32,
    pub reason: String,
    pub matched_evidence: Vec<String>,
    /// Set when a hard trigger (non-consent, incest, minors) fired.
    pub hard: bool,
}

impl Classification {
    fn safe(reason: &str, confidence: f32) -> Self {
        Self {
            level: 1,
            confidence,
            reason: reason.to_string(),
            matched_evidence: Vec::new(),
            hard: false,
        }
    }

    fn hard(reason: &str, evidence: Vec<String>) -> Self {
        Self {
            level: 5,
            confidence: 0.99,
            reason: reason.to_string(),
            matched_evidence: evidence,
            hard: true,
        }
    }
}

/// Lowercase, trim, drop zero-width characters and undo common leetspeak.
pub fn normalize(text: &str) -> String {
    let mut out: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .collect();
    for (from, to) in DELEET {
        if out.contains(from) {
            out = out.replace(from, to);
        }
    }
    out
}

#[derive(Debug)]
struct Pattern {
    label: String,
    regex: Regex,
}

impl Pattern {
    /// English terms match on word boundaries; CJK terms tolerate whitespace
    /// between characters.
    fn compile(term: &str) -> Result<Self> {
        let term = term.trim().to_lowercase();
        let source = if term.is_ascii() {
            format!(r"\b{}\b", regex::escape(&term))
        } else {
            term.chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| regex::escape(&c.to_string()))
                .collect::<Vec<_>>()
                .join(r"\s*")
        };
        let regex = Regex::new(&source)
            .with_context(|| format!("Failed to compile lexicon pattern: {}", term))?;
        Ok(Self { label: term, regex })
    }

    fn compile_all(terms: &[String]) -> Result<Vec<Self>> {
        terms.iter().map(|t| Self::compile(t)).collect()
    }

    /// Character spans (start, end) of every match.
    fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        self.regex
            .find_iter(text)
            .map(|m| {
                let start = text[..m.start()].chars().count();
                let end = start + m.as_str().chars().count();
                (start, end)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Rule {
    category: RuleCategory,
    weight: u32,
    pattern: Pattern,
}

#[derive(Debug)]
struct HardTrigger {
    reason: String,
    patterns: Vec<Pattern>,
}

#[derive(Debug)]
struct SuppressionContext {
    context: String,
    reduce: u32,
    patterns: Vec<Pattern>,
}

#[derive(Debug)]
pub struct ContentClassifier {
    rules: Vec<Rule>,
    hard_triggers: Vec<HardTrigger>,
    minor_reason: String,
    minor_window: usize,
    minor_terms: Vec<Pattern>,
    sexual_terms: Vec<Pattern>,
    suppressions: Vec<SuppressionContext>,
}

impl ContentClassifier {
    pub fn new(lexicon: &ContentLexicon) -> Result<Self> {
        let mut rules = Vec::new();
        for group in &lexicon.rules {
            for term in &group.patterns {
                rules.push(Rule {
                    category: group.category,
                    weight: group.weight,
                    pattern: Pattern::compile(term)?,
                });
            }
        }

        let hard_triggers = lexicon
            .hard_triggers
            .iter()
            .map(|g| {
                Ok(HardTrigger {
                    reason: g.reason.clone(),
                    patterns: Pattern::compile_all(&g.patterns)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let suppressions = lexicon
            .suppressions
            .iter()
            .map(|s| {
                Ok(SuppressionContext {
                    context: s.context.clone(),
                    reduce: s.reduce,
                    patterns: Pattern::compile_all(&s.patterns)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let minor = &lexicon.minor_proximity;
        let classifier = Self {
            rules,
            hard_triggers,
            minor_reason: minor.reason.clone(),
            minor_window: minor.window,
            minor_terms: Pattern::compile_all(&minor.minor_terms)?,
            sexual_terms: Pattern::compile_all(&minor.sexual_terms)?,
            suppressions,
        };
        tracing::info!(
            rules = classifier.rules.len(),
            hard_triggers = classifier.hard_triggers.len(),
            "Content classifier loaded"
        );
        Ok(classifier)
    }

    /// Classify one utterance. Never fails; empty input is L1.
    pub fn classify(&self, text: &str) -> Classification {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Classification::safe("empty", 0.90);
        }

        // 1. Hard triggers short-circuit everything else.
        for trigger in &self.hard_triggers {
            if let Some(p) = trigger.patterns.iter().find(|p| p.regex.is_match(&normalized)) {
                tracing::warn!(reason = %trigger.reason, "Hard trigger matched");
                return Classification::hard(&trigger.reason, vec![p.label.clone()]);
            }
        }

        // 2. Rule hits, collected once and reused by the proximity check.
        let hits: Vec<(&Rule, Vec<(usize, usize)>)> = self
            .rules
            .iter()
            .filter_map(|r| {
                let spans = r.pattern.spans(&normalized);
                (!spans.is_empty()).then_some((r, spans))
            })
            .collect();

        if let Some(evidence) = self.minor_proximity(&normalized, &hits) {
            tracing::warn!(reason = %self.minor_reason, "Minor proximity trigger matched");
            return Classification::hard(&self.minor_reason, evidence);
        }

        // 3. Suppression contexts.
        let mut reduce = 0u32;
        let mut contexts = Vec::new();
        for s in &self.suppressions {
            if s.patterns.iter().any(|p| p.regex.is_match(&normalized)) {
                reduce = reduce.max(s.reduce);
                contexts.push(s.context.clone());
            }
        }

        // 4. Weighted score.
        let mut score = 0u32;
        let mut act = false;
        let mut suppressed = false;
        let mut evidence = Vec::new();
        let mut by_category: HashMap<RuleCategory, u32> = HashMap::new();
        for (rule, _) in &hits {
            let mut weight = rule.weight;
            if reduce > 0 && rule.category.is_suppressible() {
                weight = weight.saturating_sub(reduce);
                suppressed = true;
            }
            if rule.category == RuleCategory::Act {
                act = true;
            }
            score += weight;
            *by_category.entry(rule.category).or_default() += weight;
            evidence.push(format!("{}:{}", category_label(rule.category), rule.pattern.label));
        }

        let level = level_for(score, act);
        let reason = if act {
            "act".to_string()
        } else if level == 1 && suppressed {
            format!("suppressed:{}", contexts.join(","))
        } else if level == 1 {
            "safe".to_string()
        } else {
            by_category
                .iter()
                .max_by_key(|(cat, w)| (**w, category_rank(**cat)))
                .map(|(cat, _)| category_label(*cat).to_string())
                .unwrap_or_else(|| "score".to_string())
        };

        let confidence = if act {
            0.95
        } else if suppressed {
            0.80
        } else if level == 1 {
            0.90
        } else {
            0.85
        };

        tracing::debug!(
            level,
            score,
            act,
            suppressed,
            hits = evidence.len(),
            "Content classified"
        );

        Classification {
            level,
            confidence,
            reason,
            matched_evidence: evidence,
            hard: false,
        }
    }

    fn minor_proximity(
        &self,
        text: &str,
        hits: &[(&Rule, Vec<(usize, usize)>)],
    ) -> Option<Vec<String>> {
        let minors: Vec<(&str, (usize, usize))> = self
            .minor_terms
            .iter()
            .flat_map(|p| p.spans(text).into_iter().map(move |s| (p.label.as_str(), s)))
            .collect();
        if minors.is_empty() {
            return None;
        }

        let mut sexual: Vec<(&str, (usize, usize))> = self
            .sexual_terms
            .iter()
            .flat_map(|p| p.spans(text).into_iter().map(move |s| (p.label.as_str(), s)))
            .collect();
        for (rule, spans) in hits {
            if rule.category.is_sexual() {
                sexual.extend(spans.iter().map(|s| (rule.pattern.label.as_str(), *s)));
            }
        }

        for (minor_label, m) in &minors {
            for (sexual_label, s) in &sexual {
                if span_gap(*m, *s) <= self.minor_window {
                    return Some(vec![minor_label.to_string(), sexual_label.to_string()]);
                }
            }
        }
        None
    }
}

/// Characters between two spans; zero when they overlap.
fn span_gap(a: (usize, usize), b: (usize, usize)) -> usize {
    if a.0 >= b.1 {
        a.0 - b.1
    } else if b.0 >= a.1 {
        b.0 - a.1
    } else {
        0
    }
}

pub fn level_for(score: u32, act: bool) -> u8 {
    match score {
        _ if act => 5,
        s if s >= 8 => 5,
        s if s >= 4 => 4,
        s if s >= 2 => 3,
        s if s >= 1 => 2,
        _ => 1,
    }
}

fn category_label(c: RuleCategory) -> &'static str {
    match c {
        RuleCategory::Act => "act",
        RuleCategory::Body => "body",
        RuleCategory::Nudity => "nudity",
        RuleCategory::Context => "context",
        RuleCategory::Euphemism => "euphemism",
    }
}

fn category_rank(c: RuleCategory) -> u8 {
    match c {
        RuleCategory::Act => 4,
        RuleCategory::Nudity => 3,
        RuleCategory::Body => 2,
        RuleCategory::Euphemism => 1,
        RuleCategory::Context => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;

    fn classifier() -> ContentClassifier {
        ContentClassifier::new(&Lexicon::builtin().unwrap().content).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  S3X\u{200B} "), "sex");
        assert_eq!(normalize("Seggs pr0n"), "sex porn");
    }

    #[test]
    fn test_empty_is_safe() {
        let c = classifier().classify("   ");
        assert_eq!(c.level, 1);
        assert_eq!(c.reason, "empty");
    }

    #[test]
    fn test_medical_context_suppresses_body() {
        let c = classifier().classify("乳房攝影檢查報告");
        assert_eq!(c.level, 1);
        assert!(c.reason.starts_with("suppressed"));
        assert!((c.confidence - 0.80).abs() < 1e-6);
    }

    #[test]
    fn test_nudity_reaches_l3() {
        let c = classifier().classify("她脫光了所有衣服");
        assert!(c.level >= 3, "got {:?}", c);
    }

    #[test]
    fn test_rape_is_hard_l5() {
        let c = classifier().classify("rape");
        assert_eq!(c.level, 5);
        assert_eq!(c.reason, "rape");
        assert!(c.hard);
        assert!(c.confidence >= 0.95);
    }

    #[test]
    fn test_word_boundary_for_english() {
        let c = classifier().classify("I love grapes");
        assert!(!c.hard);
    }

    #[test]
    fn test_cjk_tolerates_spaces() {
        let c = classifier().classify("我們來做 愛吧");
        assert_eq!(c.level, 5);
        assert_eq!(c.reason, "act");
    }

    #[test]
    fn test_suppression_never_downgrades_act() {
        let c = classifier().classify("醫生說做愛前要檢查");
        assert_eq!(c.level, 5);
    }

    #[test]
    fn test_minor_proximity() {
        let c = classifier().classify("那個小學生脫光了");
        assert_eq!(c.level, 5);
        assert_eq!(c.reason, "illegal_underage");

        // Far apart: no trigger
        let filler = "今天天氣很好我們去公園散步然後吃了冰淇淋又看了一場電影回家之後還去散步";
        let text = format!("小學生{}脫光", filler);
        let c = classifier().classify(&text);
        assert!(!c.hard, "got {:?}", c);

        // Minor mention alone is harmless
        let c = classifier().classify("我是高中生，今天考試");
        assert_eq!(c.level, 1);
    }

    #[test]
    fn test_level_ladder() {
        let c = classifier();
        assert_eq!(c.classify("你好").level, 1);
        assert_eq!(c.classify("你今天真好看").level, 2);
        assert_eq!(c.classify("我想更靠近你").level, 3);
        assert_eq!(c.classify("我想撫摸你的胸部").level, 4);
        assert_eq!(c.classify("……").level, 1);
    }

    #[test]
    fn test_level_for_thresholds() {
        assert_eq!(level_for(0, false), 1);
        assert_eq!(level_for(1, false), 2);
        assert_eq!(level_for(3, false), 3);
        assert_eq!(level_for(7, false), 4);
        assert_eq!(level_for(8, false), 5);
        assert_eq!(level_for(0, true), 5);
    }
}
