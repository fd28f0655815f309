//! Parsing of the provider's structured reply.
//!
//! Providers do not always honour `response_format`: the object may arrive
//! wrapped in prose or a code fence, with `+3` style numbers, or in the older
//! `content --- {json}` layout. All of these are accepted; anything without a
//! usable `content` string is a schema violation.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use wavess_core::models::{ChatMode, Mood};

/// Change applied when the model omits `emotion_delta`.
pub const DEFAULT_AFFECTION_CHANGE: i32 = 1;

const LEGACY_SEPARATOR: &str = "---";

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterReply {
    pub content: String,
    pub affection_change: i32,
    /// `None` when missing, `unchanged` or outside the mood set. The model's
    /// relationship and intimacy labels are not kept: tiers follow affection.
    pub mood: Option<Mood>,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

static RE_PLUS_SIGN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\s*\+(\d)").unwrap());

/// First balanced `{...}` in `text`, skipping braces inside JSON strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            let candidate = &text[start..start + end];
            if serde_json::from_str::<Value>(&clean_numbers(candidate)).is_ok() {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the balanced object starting at `s[0] == '{'`.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// `"affection_change": +3` is not JSON.
fn clean_numbers(json: &str) -> String {
    RE_PLUS_SIGN.replace_all(json, ": $1").into_owned()
}

fn affection_change(obj: &Value) -> i32 {
    let raw = match &obj["emotion_delta"] {
        Value::Object(map) => map.get("affection_change"),
        Value::Null => None,
        other => Some(other),
    };
    match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .map(|v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
            .unwrap_or(DEFAULT_AFFECTION_CHANGE),
        Some(Value::String(s)) => s
            .trim()
            .trim_start_matches('+')
            .parse()
            .unwrap_or(DEFAULT_AFFECTION_CHANGE),
        _ => DEFAULT_AFFECTION_CHANGE,
    }
}

fn opt_string(obj: &Value, key: &str) -> Option<String> {
    obj[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn from_object(obj: &Value, fallback_content: Option<&str>) -> Result<CharacterReply, ParseFailure> {
    if !obj.is_object() {
        return Err(ParseFailure::new("reply is not a JSON object"));
    }
    let content = opt_string(obj, "content")
        .or_else(|| fallback_content.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
        .ok_or_else(|| ParseFailure::new("missing or empty `content`"))?;

    Ok(CharacterReply {
        content,
        affection_change: affection_change(obj),
        mood: opt_string(obj, "mood").and_then(|m| m.to_lowercase().parse().ok()),
        reasoning: opt_string(obj, "reasoning"),
    })
}

/// Parse one raw provider reply.
pub fn parse_reply(raw: &str) -> Result<CharacterReply, ParseFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure::new("empty reply"));
    }

    // Legacy layout: free text, a separator line, then the state object.
    if let Some(idx) = trimmed.find(LEGACY_SEPARATOR) {
        let (head, tail) = trimmed.split_at(idx);
        let head = head.trim();
        if !head.is_empty() && !head.starts_with('{') && !head.starts_with("```") {
            if let Some(json) = extract_json_object(tail) {
                let value: Value = serde_json::from_str(&clean_numbers(json))
                    .map_err(|e| ParseFailure::new(e.to_string()))?;
                return from_object(&value, Some(head));
            }
        }
    }

    let json = extract_json_object(trimmed)
        .ok_or_else(|| ParseFailure::new("no JSON object found in reply"))?;
    let value: Value =
        serde_json::from_str(&clean_numbers(json)).map_err(|e| ParseFailure::new(e.to_string()))?;
    from_object(&value, None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthCheck {
    Within,
    Short,
    Long,
    /// Below half the minimum.
    SevereShort,
    /// Above twice the maximum.
    SevereLong,
}

impl LengthCheck {
    pub fn is_severe(&self) -> bool {
        matches!(self, LengthCheck::SevereShort | LengthCheck::SevereLong)
    }
}

/// Reply length in characters against the chat-mode bounds.
pub fn check_length(content: &str, mode: ChatMode) -> (usize, LengthCheck) {
    let (min, max) = mode.word_bounds();
    let n = content.chars().filter(|c| !c.is_whitespace()).count();
    let check = if n * 2 < min {
        LengthCheck::SevereShort
    } else if n > max * 2 {
        LengthCheck::SevereLong
    } else if n < min {
        LengthCheck::Short
    } else if n > max {
        LengthCheck::Long
    } else {
        LengthCheck::Within
    };
    (n, check)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_object() {
        let r = parse_reply(
            r#"{"content":"*輕笑*早安。","emotion_delta":{"affection_change":2},"mood":"happy","relationship":"friend","intimacy_level":"friendly"}"#,
        )
        .unwrap();
        assert_eq!(r.content, "*輕笑*早安。");
        assert_eq!(r.affection_change, 2);
        assert_eq!(r.mood, Some(Mood::Happy));
        assert!(r.reasoning.is_none());
    }

    #[test]
    fn test_code_fence_and_prose() {
        let raw = "好的，以下是回覆：\n```json\n{\"content\": \"你來了 {笑}\", \"emotion_delta\": {\"affection_change\": -1}}\n```\n";
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.content, "你來了 {笑}");
        assert_eq!(r.affection_change, -1);
    }

    #[test]
    fn test_braces_inside_strings() {
        let raw = r#"{"content": "他說 \"}\" 然後笑了", "mood": "shy"}"#;
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.content, "他說 \"}\" 然後笑了");
        assert_eq!(r.mood, Some(Mood::Shy));
    }

    #[test]
    fn test_plus_sign_cleaned() {
        let r = parse_reply(r#"{"content":"嗯","emotion_delta":{"affection_change": +3}}"#).unwrap();
        assert_eq!(r.affection_change, 3);
    }

    #[test]
    fn test_missing_delta_defaults() {
        let r = parse_reply(r#"{"content":"嗯","mood":"not-a-mood"}"#).unwrap();
        assert_eq!(r.affection_change, DEFAULT_AFFECTION_CHANGE);
        assert_eq!(r.mood, None);
        let r = parse_reply(r#"{"content":"嗯","mood":"unchanged"}"#).unwrap();
        assert_eq!(r.mood, None);
    }

    #[test]
    fn test_legacy_layout() {
        let raw = "*靠近*今晚的月色很美。\n---\n{\"emotion_delta\": {\"affection_change\": 2}, \"mood\": \"romantic\"}";
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.content, "*靠近*今晚的月色很美。");
        assert_eq!(r.affection_change, 2);
        assert_eq!(r.mood, Some(Mood::Romantic));
    }

    #[test]
    fn test_violations() {
        assert!(parse_reply("hello").is_err());
        assert!(parse_reply("").is_err());
        assert!(parse_reply(r#"{"mood":"happy"}"#).is_err());
        assert!(parse_reply(r#"{"content":"   "}"#).is_err());
    }

    #[test]
    fn test_length_check() {
        let ok = "字".repeat(200);
        assert_eq!(check_length(&ok, ChatMode::Casual), (200, LengthCheck::Within));
        assert_eq!(check_length(&"字".repeat(100), ChatMode::Casual).1, LengthCheck::Short);
        assert_eq!(check_length(&"字".repeat(60), ChatMode::Casual).1, LengthCheck::SevereShort);
        assert_eq!(check_length(&"字".repeat(300), ChatMode::Casual).1, LengthCheck::Long);
        assert!(check_length(&"字".repeat(1001), ChatMode::Novel).1.is_severe());
    }
}
