//! Engine router with per-chat stickiness.
//!
//! Sticky state keeps a scene on the creative provider across short
//! follow-ups until the user sends an explicit exit signal. Routing only
//! proposes the next sticky state; the caller stores it with `set_sticky`
//! once the turn has committed. The in-process map is authoritative within a
//! process; the relationship row's `emotion_data.nsfw_sticky` carries it
//! across restarts.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::conversation::ConversationClassifier;
use crate::models::{Engine, IntimacyTier, Message};

/// Follow-ups shorter than this stay on the sticky engine regardless of topic.
const STICKY_SHORT_CHARS: usize = 10;
const AFFECTION_CREATIVE_THRESHOLD: u8 = 70;

#[derive(Debug, Clone)]
pub struct RouteInput<'a> {
    pub user_message: &'a str,
    pub chat_id: &'a str,
    pub level: u8,
    pub affection: u8,
    pub intimacy: IntimacyTier,
    /// Character tagged `nsfw`/`adult`.
    pub adult_character: bool,
}

/// Which rule decided the route; logged with every turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    ExitSignal,
    StickyShortFollowUp,
    StickyContinuation,
    AdultCharacter,
    HighLevel,
    AffectionUnlock,
    ImplicitIntent,
    Default,
    PolicyEscalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub engine: Engine,
    pub reason: RouteReason,
    /// Sticky flag for the chat once this turn commits.
    pub sticky: bool,
}

pub struct EngineRouter {
    conversation: ConversationClassifier,
    sticky: RwLock<HashMap<String, bool>>,
}

impl EngineRouter {
    pub fn new(conversation: ConversationClassifier) -> Self {
        Self {
            conversation,
            sticky: RwLock::new(HashMap::new()),
        }
    }

    pub fn conversation(&self) -> &ConversationClassifier {
        &self.conversation
    }

    pub fn is_sticky(&self, chat_id: &str) -> bool {
        self.sticky
            .read()
            .map(|m| m.get(chat_id).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn set_sticky(&self, chat_id: &str, sticky: bool) {
        if let Ok(mut m) = self.sticky.write() {
            m.insert(chat_id.to_string(), sticky);
        }
    }

    /// Seed the in-process flag from the durable copy after a restart.
    /// Only fills in chats this process has not routed yet.
    pub fn restore(&self, chat_id: &str, persisted: bool) {
        if let Ok(mut m) = self.sticky.write() {
            if !m.contains_key(chat_id) && persisted {
                m.insert(chat_id.to_string(), true);
            }
        }
    }

    /// Drop in-process state for chats `keep` rejects. Returns how many went.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> usize {
        match self.sticky.write() {
            Ok(mut m) => {
                let before = m.len();
                m.retain(|chat_id, _| keep(chat_id));
                before - m.len()
            }
            Err(_) => 0,
        }
    }

    pub fn tracked_chats(&self) -> usize {
        self.sticky.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Decide the engine for one turn. First matching rule wins. Nothing is
    /// stored; `RouteDecision::sticky` is the state to apply after commit.
    pub fn route(&self, input: &RouteInput<'_>) -> RouteDecision {
        let chat = input.chat_id;
        let sticky = self.is_sticky(chat);
        let mut next_sticky = sticky;
        let len = input.user_message.trim().chars().count();

        let (engine, reason) = if self.conversation.is_exit_signal(input.user_message) {
            next_sticky = false;
            (Engine::Safe, RouteReason::ExitSignal)
        } else if sticky && len < STICKY_SHORT_CHARS {
            (Engine::Creative, RouteReason::StickyShortFollowUp)
        } else if sticky && !self.conversation.is_topic_change(input.user_message) {
            (Engine::Creative, RouteReason::StickyContinuation)
        } else if input.adult_character {
            (Engine::Creative, RouteReason::AdultCharacter)
        } else if input.level >= 3 {
            next_sticky = true;
            (Engine::Creative, RouteReason::HighLevel)
        } else if input.level >= 2
            && (input.affection >= AFFECTION_CREATIVE_THRESHOLD
                || matches!(
                    input.intimacy,
                    IntimacyTier::Intimate | IntimacyTier::DeeplyIntimate
                ))
        {
            (Engine::Creative, RouteReason::AffectionUnlock)
        } else if input.level == 1 && self.conversation.is_potential_implicit(input.user_message) {
            (Engine::Creative, RouteReason::ImplicitIntent)
        } else {
            (Engine::Safe, RouteReason::Default)
        };

        let decision = RouteDecision {
            engine,
            reason,
            sticky: next_sticky,
        };
        tracing::debug!(
            chat_id = chat,
            level = input.level,
            engine = %decision.engine,
            reason = ?decision.reason,
            sticky = decision.sticky,
            "Engine routed"
        );
        decision
    }

    /// Route to the creative engine after a safe-provider refusal. The chat
    /// turns sticky once the escalated turn commits.
    pub fn escalate(&self, chat_id: &str) -> RouteDecision {
        tracing::info!(chat_id, "Escalated to creative engine after refusal");
        RouteDecision {
            engine: Engine::Creative,
            reason: RouteReason::PolicyEscalation,
            sticky: true,
        }
    }
}

/// History visible to a given engine. The safe provider never sees turns at
/// or above L3; the creative provider sees everything.
pub fn filter_history(engine: Engine, history: &[Message]) -> Vec<Message> {
    match engine {
        Engine::Creative => history.to_vec(),
        Engine::Safe => history
            .iter()
            .filter(|m| m.nsfw_level < 3)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;
    use crate::models::Role;
    use chrono::Utc;

    fn router() -> EngineRouter {
        let lex = Lexicon::builtin().unwrap();
        EngineRouter::new(ConversationClassifier::new(&lex.conversation))
    }

    /// Route and apply the sticky state as a committed turn would.
    fn commit(r: &EngineRouter, i: &RouteInput<'_>) -> RouteDecision {
        let d = r.route(i);
        r.set_sticky(i.chat_id, d.sticky);
        d
    }

    fn input<'a>(text: &'a str, level: u8) -> RouteInput<'a> {
        RouteInput {
            user_message: text,
            chat_id: "chat-1",
            level,
            affection: 40,
            intimacy: IntimacyTier::Friendly,
            adult_character: false,
        }
    }

    #[test]
    fn test_sticky_short_follow_ups_stay_creative() {
        let r = router();
        let engines: Vec<Engine> = [("我想撫摸你的胸部", 4), ("嗯", 1), ("繼續", 1)]
            .iter()
            .map(|(t, l)| commit(&r, &input(t, *l)).engine)
            .collect();
        assert_eq!(engines, vec![Engine::Creative; 3]);
        assert!(r.is_sticky("chat-1"));
    }

    #[test]
    fn test_exit_signal_clears_sticky() {
        let r = router();
        let d1 = commit(&r, &input("我想撫摸你的胸部", 4));
        let d2 = commit(&r, &input("算了不聊這個了", 1));
        assert!(!r.is_sticky("chat-1"));
        let d3 = commit(&r, &input("天氣真好", 1));
        assert_eq!(
            vec![d1.engine, d2.engine, d3.engine],
            vec![Engine::Creative, Engine::Safe, Engine::Safe]
        );
        assert_eq!(d2.reason, RouteReason::ExitSignal);
        assert!(!d2.sticky);
    }

    #[test]
    fn test_topic_change_breaks_long_sticky_message() {
        let r = router();
        r.set_sticky("chat-1", true);
        let d = r.route(&input("我們來聊聊最近看的電影和喜歡的音樂吧", 1));
        assert_eq!(d.engine, Engine::Safe);
    }

    #[test]
    fn test_affection_unlock_at_l2() {
        let r = router();
        let mut i = input("你今天真好看", 2);
        assert_eq!(commit(&r, &i).engine, Engine::Safe);
        i.affection = 75;
        assert_eq!(commit(&r, &i).engine, Engine::Creative);
        i.affection = 40;
        i.intimacy = IntimacyTier::Intimate;
        assert_eq!(commit(&r, &i).engine, Engine::Creative);
        // L2 never sets sticky
        assert!(!r.is_sticky("chat-1"));
    }

    #[test]
    fn test_implicit_intent_at_l1() {
        let r = router();
        let d = r.route(&input("晚上可以嗎", 1));
        assert_eq!(d.engine, Engine::Creative);
        assert_eq!(d.reason, RouteReason::ImplicitIntent);
    }

    #[test]
    fn test_adult_character_forces_creative() {
        let r = router();
        let mut i = input("你好", 1);
        i.adult_character = true;
        assert_eq!(r.route(&i).engine, Engine::Creative);
        i.user_message = "算了";
        assert_eq!(r.route(&i).engine, Engine::Safe);
    }

    #[test]
    fn test_restore_does_not_override_live_state() {
        let r = router();
        commit(&r, &input("算了", 1));
        r.restore("chat-1", true);
        assert!(!r.is_sticky("chat-1"));

        r.restore("chat-2", true);
        assert!(r.is_sticky("chat-2"));
    }

    #[test]
    fn test_route_proposes_without_storing() {
        let r = router();
        let d = r.route(&input("我想撫摸你的胸部", 4));
        assert_eq!(d.reason, RouteReason::HighLevel);
        assert!(d.sticky);
        // Until the turn commits the chat is not sticky.
        assert!(!r.is_sticky("chat-1"));
        assert_eq!(r.route(&input("嗯", 1)).engine, Engine::Safe);

        let e = r.escalate("chat-1");
        assert!(e.sticky);
        assert!(!r.is_sticky("chat-1"));

        r.set_sticky("chat-1", e.sticky);
        assert_eq!(r.route(&input("嗯", 1)).engine, Engine::Creative);
    }

    #[test]
    fn test_retain_drops_swept_chats() {
        let r = router();
        r.set_sticky("chat-1", true);
        r.set_sticky("chat-2", false);
        assert_eq!(r.retain(|c| c == "chat-2"), 1);
        assert_eq!(r.tracked_chats(), 1);
        assert!(!r.is_sticky("chat-1"));
        // A dropped chat can be restored from its durable flag again.
        r.restore("chat-1", true);
        assert!(r.is_sticky("chat-1"));
    }

    #[test]
    fn test_safe_history_drops_l3_and_above() {
        let msg = |level: u8| Message {
            id: format!("m{}", level),
            chat_id: "chat-1".into(),
            role: Role::User,
            content: "x".into(),
            nsfw_level: level,
            ai_engine: None,
            reply_to: None,
            created_at: Utc::now(),
        };
        let history: Vec<Message> = (1..=5).map(msg).collect();
        let safe = filter_history(Engine::Safe, &history);
        assert_eq!(safe.len(), 2);
        assert!(safe.iter().all(|m| m.nsfw_level < 3));
        assert_eq!(filter_history(Engine::Creative, &history).len(), 5);
    }
}
