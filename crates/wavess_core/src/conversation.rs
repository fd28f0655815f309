//! Conversation-flow signals used by the router: exit intent, topic changes
//! and euphemistic ("implicit") intent in short messages.

use crate::classifier::normalize;
use crate::lexicon::ConversationLexicon;

/// Messages shorter than this (in characters) need only one euphemism hit.
const SHORT_MESSAGE_CHARS: usize = 20;

#[derive(Debug, Clone)]
pub struct ConversationClassifier {
    exit_signals: Vec<String>,
    topic_changes: Vec<String>,
    implicit_patterns: Vec<String>,
}

impl ConversationClassifier {
    pub fn new(lexicon: &ConversationLexicon) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            exit_signals: lower(&lexicon.exit_signals),
            topic_changes: lower(&lexicon.topic_changes),
            implicit_patterns: lower(&lexicon.implicit_patterns),
        }
    }

    pub fn is_exit_signal(&self, text: &str) -> bool {
        let text = normalize(text);
        self.exit_signals.iter().any(|w| text.contains(w.as_str()))
    }

    pub fn is_topic_change(&self, text: &str) -> bool {
        let text = normalize(text);
        self.topic_changes.iter().any(|w| text.contains(w.as_str()))
    }

    /// Two or more euphemism hits, or one hit in a short message.
    pub fn is_potential_implicit(&self, text: &str) -> bool {
        let text = normalize(text);
        let hits = self
            .implicit_patterns
            .iter()
            .filter(|w| text.contains(w.as_str()))
            .count();
        hits >= 2 || (hits >= 1 && text.chars().count() < SHORT_MESSAGE_CHARS)
    }
}
