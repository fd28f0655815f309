//! Property-based tests for reply parsing, length checks and level capping.

use proptest::prelude::*;

use wavess_core::models::{ChatMode, UserPreferences};
use wavess_reasoning::engine::capped_level;
use wavess_reasoning::parse::{check_length, extract_json_object, parse_reply, LengthCheck};

// ============================================================================
// Parse Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Arbitrary provider output never panics the parser.
    #[test]
    fn parse_never_panics(s in "\\PC{0,600}") {
        let _ = parse_reply(&s);
    }

    /// A successful parse always carries non-empty content.
    #[test]
    fn parsed_content_non_empty(s in "\\PC{0,300}") {
        if let Ok(reply) = parse_reply(&s) {
            prop_assert!(!reply.content.trim().is_empty());
        }
    }

    /// Any well-formed reply survives being wrapped in prose.
    #[test]
    fn wrapped_reply_recovered(
        content in "[\\p{Han}a-z]{1,40}",
        delta in -5i32..=5,
        prefix in "[a-z ,.]{0,30}",
        suffix in "[a-z ,.]{0,30}",
    ) {
        let body = serde_json::json!({
            "content": content,
            "emotion_delta": {"affection_change": delta},
        });
        let raw = format!("{}{}{}", prefix, body, suffix);
        let reply = parse_reply(&raw).unwrap();
        prop_assert_eq!(reply.content, content);
        prop_assert_eq!(reply.affection_change, delta);
    }

    /// An extracted object always starts and ends with a brace.
    #[test]
    fn extracted_object_is_braced(s in "\\PC{0,300}") {
        if let Some(obj) = extract_json_object(&s) {
            prop_assert!(obj.starts_with('{'), "object should start with an opening brace");
            prop_assert!(obj.ends_with('}'), "object should end with a closing brace");
        }
    }
}

// ============================================================================
// Length and Level Properties
// ============================================================================

fn mode_strategy() -> impl Strategy<Value = ChatMode> {
    prop_oneof![Just(ChatMode::Casual), Just(ChatMode::Novel)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The count ignores whitespace, and the verdict agrees with the bounds.
    #[test]
    fn length_check_consistent(n in 0usize..2500, spaces in 0usize..50, mode in mode_strategy()) {
        let text = format!("{}{}", "字".repeat(n), " ".repeat(spaces));
        let (count, check) = check_length(&text, mode);
        prop_assert_eq!(count, n);
        let (min, max) = mode.word_bounds();
        prop_assert_eq!(check == LengthCheck::Within, (min..=max).contains(&n));
        prop_assert_eq!(check.is_severe(), n * 2 < min || n > max * 2);
    }

    /// The capped level never exceeds either the classified level or the user cap.
    #[test]
    fn capped_level_bounded(level in 1u8..=5, cap in 1u8..=5, enabled in any::<bool>()) {
        let prefs = UserPreferences {
            nsfw_enabled: enabled,
            max_nsfw_level: cap,
            ..UserPreferences::default()
        };
        let capped = capped_level(&prefs, level);
        prop_assert!(capped >= 1);
        prop_assert!(capped <= level);
        if enabled {
            prop_assert!(capped <= cap);
        } else {
            prop_assert_eq!(capped, 1);
        }
    }
}
