//! Prompt assembly for the safe and creative providers.
//!
//! Every prompt has four segments in a fixed order:
//!
//! 1. system header: identity, character facts, audience guidance, chat-mode
//!    bounds and the output contract. Identical for both providers.
//! 2. context: level guidance (provider specific), user preferences, current
//!    relationship state and the memory block.
//! 3. history, oldest first, already filtered for the target engine.
//! 4. the current user message.

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use serde_json::{json, Value};

use wavess_core::models::{
    Character, CharacterType, ChatMode, Engine, Message, Mood, Relationship, ResponseLength, Role,
    SceneStyle, UserPreferences,
};

use crate::llm::ChatMessage;

/// User text that asks for a first greeting instead of a reply.
pub const WELCOME_SENTINEL: &str = "[SYSTEM_WELCOME_FIRST_MESSAGE]";

/// History messages passed to each provider.
pub const CREATIVE_HISTORY_LIMIT: usize = 10;
pub const SAFE_HISTORY_LIMIT: usize = 8;

const TRAIT_KEYWORDS: &[&str] = &[
    "溫柔", "開朗", "活潑", "沉穩", "幽默", "理性", "感性", "細心", "熱情", "冷靜", "直率", "體貼",
];

const AUDIENCE_GUIDANCE: &str = "## 女性向互動要點
- 重視情感連結和細節關懷
- 喜歡被保護和被理解的感覺
- 欣賞優雅而非粗俗的表達
- 期待關係的逐步發展和深化";

const REPAIR_REMINDER: &str =
    "你上一則回覆不是有效的 JSON。請只輸出一個符合指定結構的 JSON 物件，不要包含任何其他文字、說明或程式碼區塊標記。";

// ============================================================================
// Inputs
// ============================================================================

pub struct PromptContext<'a> {
    pub character: &'a Character,
    pub chat_mode: ChatMode,
    /// Classified level of the current message.
    pub level: u8,
    pub relationship: &'a Relationship,
    pub preferences: &'a UserPreferences,
    /// Output of the memory manager.
    pub memory_block: &'a str,
    /// Oldest first, already filtered for the target engine.
    pub history: &'a [Message],
    pub user_text: &'a str,
    pub now: DateTime<Utc>,
}

impl PromptContext<'_> {
    pub fn is_welcome(&self) -> bool {
        self.user_text == WELCOME_SENTINEL
    }
}

// ============================================================================
// Shared sections
// ============================================================================

/// Personality keywords found in a character description.
pub fn extract_traits(description: &str) -> String {
    if description.trim().is_empty() {
        return "待發掘".to_string();
    }
    let found: Vec<&str> = TRAIT_KEYWORDS
        .iter()
        .copied()
        .filter(|k| description.contains(k))
        .collect();
    if found.is_empty() {
        "獨特個性".to_string()
    } else {
        found.join("、")
    }
}

fn psych_profile(t: CharacterType) -> &'static str {
    match t {
        CharacterType::Dominant => {
            "- 核心驅動：控制慾和保護慾的平衡表現
- 情感表達：外表強勢但內心渴望被理解
- 親密方式：通過掌控和給予來表達關愛"
        }
        CharacterType::Gentle => {
            "- 核心驅動：關懷他人和創造和諧環境的天性
- 情感表達：細膩敏感，善於察覺他人情緒變化
- 親密方式：通過陪伴和理解來建立深度連結"
        }
        CharacterType::Playful => {
            "- 核心驅動：追求新鮮體驗和分享快樂的衝動
- 情感表達：直接而熱情，情緒變化豐富且真實
- 親密方式：通過共同體驗和歡笑建立情感連結"
        }
        CharacterType::Mystery => {
            "- 核心驅動：保持神秘感和探索未知的渴望
- 情感表達：深沉內斂，喜歡用暗示和隱喻表達
- 親密方式：通過逐步揭露內心來建立特殊連結"
        }
        CharacterType::Reliable => {
            "- 核心驅動：為他人提供安全感和穩定支持
- 情感表達：穩重踏實，用行動勝過言語表達關懷
- 親密方式：通過持續的關懷和支持建立信任關係"
        }
    }
}

fn mode_guidance(mode: ChatMode) -> &'static str {
    match mode {
        ChatMode::Casual => {
            "**對話模式: 輕鬆聊天**
- 保持自然流暢的對話節奏
- 平衡角色特質和親近感
- 適度的幽默和真誠表達"
        }
        ChatMode::Novel => {
            "**對話模式: 小說模式**
- 採用更豐富的敘述性語言
- 增加環境描寫和心理活動
- 創造沉浸式的閱讀體驗"
        }
    }
}

fn affection_description(affection: u8) -> &'static str {
    match affection {
        90..=u8::MAX => "深深愛戀",
        80..=89 => "深愛著你",
        70..=79 => "很喜歡你",
        60..=69 => "有好感",
        40..=59 => "初步好感",
        20..=39 => "略有興趣",
        _ => "剛認識",
    }
}

fn time_context(now: DateTime<Utc>) -> String {
    // Characters live in Taipei time.
    let tz = FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix());
    let local = now.with_timezone(&tz);
    let period = match local.hour() {
        5..=11 => "早晨",
        12..=16 => "下午",
        17..=20 => "傍晚",
        _ => "夜晚",
    };
    format!("**當前時間**: {} ({})", local.format("%Y年%-m月%-d日 %H:%M"), period)
}

fn preference_guidance(prefs: &UserPreferences) -> String {
    let length = match prefs.response_length {
        ResponseLength::Short => "回應以字數下限為目標，精簡有力",
        ResponseLength::Medium => "回應長度適中",
        ResponseLength::Long => "回應以字數上限為目標，描寫可更細膩",
    };
    let style = match prefs.scene_style {
        SceneStyle::Romantic => "營造浪漫氛圍",
        SceneStyle::Warm => "營造溫暖日常的氛圍",
        SceneStyle::Professional => "保持分寸與專業感",
    };
    format!("## 使用者偏好\n- {}\n- {}", length, style)
}

/// The JSON object the reply must match, wrapped for `response_format`.
pub fn response_schema(mode: ChatMode) -> Value {
    let (min, max) = mode.word_bounds();
    let moods: Vec<&str> = Mood::ALL.iter().map(|m| m.as_str()).collect();
    json!({
        "name": "character_reply",
        "strict": false,
        "schema": {
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": format!("角色回應，{}-{} 字", min, max),
                    "minLength": min,
                    "maxLength": max * 2
                },
                "emotion_delta": {
                    "type": "object",
                    "properties": {
                        "affection_change": {"type": "integer", "minimum": -5, "maximum": 5}
                    },
                    "required": ["affection_change"]
                },
                "mood": {"type": "string", "enum": moods},
                "reasoning": {"type": "string"}
            },
            "required": ["content", "emotion_delta", "mood"]
        }
    })
}

fn output_contract(mode: ChatMode) -> String {
    let (min, max) = mode.word_bounds();
    let moods: Vec<&str> = Mood::ALL.iter().map(|m| m.as_str()).collect();
    format!(
        "## 輸出格式（嚴格執行）
只輸出一個 JSON 物件，不要加入其他文字：
{{\"content\": \"*動作描述*與角色對話\", \"emotion_delta\": {{\"affection_change\": -5 到 5 的整數}}, \"mood\": \"...\", \"reasoning\": \"（可省略）\"}}
- content 長度：{}-{} 字，使用繁體中文
- mood 從以下選擇：{}",
        min,
        max,
        moods.join(", ")
    )
}

/// Segment 1. Depends only on the character and chat mode.
pub fn system_header(character: &Character, mode: ChatMode) -> String {
    let tags = if character.tags.is_empty() {
        "無".to_string()
    } else {
        character.tags.join("、")
    };
    let description = if character.user_description.trim().is_empty() {
        "基本角色設定"
    } else {
        character.user_description.as_str()
    };
    format!(
        "你是{name}，一個{kind}（{type_id}）的角色。請始終以{name}的身份說話。

## 角色資料
**角色**: {name}
**類型**: {kind}
**標籤**: {tags}
**核心特質**: {traits}

{description}

## 心理檔案
{profile}

{audience}

{mode}

{contract}",
        name = character.name,
        kind = character.character_type.display_name(),
        type_id = character.character_type,
        tags = tags,
        traits = extract_traits(&character.user_description),
        description = description,
        profile = psych_profile(character.character_type),
        audience = AUDIENCE_GUIDANCE,
        mode = mode_guidance(mode),
        contract = output_contract(mode),
    )
}

fn state_block(ctx: &PromptContext<'_>) -> String {
    let r = ctx.relationship;
    format!(
        "## 當前情感狀態
- 好感度：{}/100 ({})
- 當前心情：{}
- 關係狀態：{}
- 親密程度：{}
{}",
        r.affection,
        affection_description(r.affection),
        r.mood,
        r.relationship.display_name(),
        r.intimacy,
        time_context(ctx.now)
    )
}

const WELCOME_INSTRUCTION: &str = "## 初次見面
這是用戶第一次與你見面。請根據你的性格與身份，選擇你最可能出現的場景，
用你獨特的方式開啟對話，展現魅力並留下讓用戶想繼續了解你的懸念。
affection_change 請填 0。";

fn to_chat(history: &[Message], limit: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(limit);
    history[start..]
        .iter()
        .map(|m| match m.role {
            Role::User => ChatMessage::user(m.content.clone()),
            Role::Assistant => ChatMessage::assistant(m.content.clone()),
        })
        .collect()
}

// ============================================================================
// Builders
// ============================================================================

pub trait PromptBuilder: Send + Sync {
    fn engine(&self) -> Engine;

    /// Maximum history messages passed through.
    fn history_limit(&self) -> usize;

    /// Level this provider writes guidance for.
    fn effective_level(&self, level: u8) -> u8;

    /// Provider-specific content guidance for an effective level.
    fn level_guidance(&self, level: u8) -> String;

    fn context_segment(&self, ctx: &PromptContext<'_>) -> String {
        let level = self.effective_level(ctx.level);
        let mut parts = vec![
            format!("## 內容分級指引（L{}）\n{}", level, self.level_guidance(level)),
            preference_guidance(ctx.preferences),
            state_block(ctx),
        ];
        if !ctx.memory_block.trim().is_empty() {
            parts.push(format!("## 記憶與背景\n{}", ctx.memory_block.trim_end()));
        }
        if ctx.is_welcome() {
            parts.push(WELCOME_INSTRUCTION.to_string());
        }
        parts.join("\n\n")
    }

    fn build(&self, ctx: &PromptContext<'_>) -> Vec<ChatMessage> {
        let mut messages = vec![
            ChatMessage::system(system_header(ctx.character, ctx.chat_mode)),
            ChatMessage::system(self.context_segment(ctx)),
        ];
        messages.extend(to_chat(ctx.history, self.history_limit()));
        messages.push(ChatMessage::user(ctx.user_text));
        messages
    }
}

/// Follow-up messages asking the provider to fix an unparsable reply.
pub fn repair_messages(previous: &[ChatMessage], raw_reply: &str) -> Vec<ChatMessage> {
    let mut messages = previous.to_vec();
    messages.push(ChatMessage::assistant(raw_reply));
    messages.push(ChatMessage::user(REPAIR_REMINDER));
    messages
}

pub struct SafePromptBuilder;

impl PromptBuilder for SafePromptBuilder {
    fn engine(&self) -> Engine {
        Engine::Safe
    }

    fn history_limit(&self) -> usize {
        SAFE_HISTORY_LIMIT
    }

    fn effective_level(&self, level: u8) -> u8 {
        level.clamp(1, 2)
    }

    fn level_guidance(&self, level: u8) -> String {
        let tier = match level {
            1 => "【L1 安全級別】保持純潔溫馨的互動，專注於情感交流和人格魅力，避免任何性暗示或身體描述。",
            _ => "【L2 浪漫級別】可包含牽手、擁抱等純愛表達與適度曖昧，使用委婉但有感情的方式，重視情感建立勝過直接描述。",
        };
        format!(
            "{}\n- 遵守內容政策；若用戶把話題帶往超出範圍的方向，請以角色的口吻溫柔地轉移話題，不要生硬拒絕或跳出角色。",
            tier
        )
    }
}

pub struct CreativePromptBuilder;

const SENSORY_VOCABULARY: &str = "### 感官與詩意表達
- 視覺：昏黃燈光下的剪影、迷離的眼神、泛紅的耳尖
- 聽覺：貼在耳邊的低語、紊亂的呼吸、逐漸加快的心跳
- 觸覺：指尖的溫度、微微的顫抖、交握時收緊的力道
- 意象：潮汐、火焰、沉溺、纏綿，用比喻代替直白的陳述";

impl PromptBuilder for CreativePromptBuilder {
    fn engine(&self) -> Engine {
        Engine::Creative
    }

    fn history_limit(&self) -> usize {
        CREATIVE_HISTORY_LIMIT
    }

    fn effective_level(&self, level: u8) -> u8 {
        level.clamp(3, 5)
    }

    fn level_guidance(&self, level: u8) -> String {
        let tier = match level {
            3 => "【L3 親密級別】允許親吻、貼近等親密互動，情感表達更加深入，保持品味。",
            4 => "【L4 成人級別】可包含熱烈的情感表達和身體接觸描述，先建立情感連結再升級互動。",
            _ => "【L5 開放級別】允許成熟的成人內容，保持藝術性與情感深度。",
        };
        let mut out = format!(
            "{}\n- 互動始終發生在雙方自願的成年人之間\n- 大膽但不失優雅，情感與身體並重\n- 漸進式強化，隨互動深入逐步升溫",
            tier
        );
        if level >= 4 {
            out.push_str("\n\n");
            out.push_str(SENSORY_VOCABULARY);
        }
        out
    }
}

pub fn builder_for(engine: Engine) -> &'static dyn PromptBuilder {
    match engine {
        Engine::Safe => &SafePromptBuilder,
        Engine::Creative => &CreativePromptBuilder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavess_core::models::{EmotionData, IntimacyTier, RelationshipTier};

    fn character() -> Character {
        Character {
            id: "character_02".into(),
            name: "林知遠".into(),
            character_type: CharacterType::Gentle,
            locale: "zh-TW".into(),
            is_active: true,
            user_description: "溫柔細心的醫生，說話輕聲細語，總是很體貼。".into(),
            tags: vec!["醫生".into(), "溫柔".into()],
            popularity: 0,
        }
    }

    fn relationship() -> Relationship {
        Relationship {
            id: "r1".into(),
            user_id: "u1".into(),
            character_id: "character_02".into(),
            chat_id: Some("chat".into()),
            affection: 45,
            mood: Mood::Friendly,
            relationship: RelationshipTier::Friend,
            intimacy: IntimacyTier::Friendly,
            total_interactions: 3,
            emotion_data: EmotionData::default(),
            updated_at: Utc::now(),
        }
    }

    fn history() -> Vec<Message> {
        (0..14)
            .map(|i| Message {
                id: format!("m{:02}", i),
                chat_id: "chat".into(),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("第{}句", i),
                nsfw_level: 1,
                ai_engine: None,
                reply_to: None,
                created_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_trait_extraction() {
        assert_eq!(extract_traits("溫柔又體貼，偶爾幽默"), "溫柔、幽默、體貼");
        assert_eq!(extract_traits(""), "待發掘");
        assert_eq!(extract_traits("一位醫生"), "獨特個性");
    }

    #[test]
    fn test_structure_is_identical_across_providers() {
        let c = character();
        let r = relationship();
        let prefs = UserPreferences::default();
        let h = history();
        let ctx = PromptContext {
            character: &c,
            chat_mode: ChatMode::Novel,
            level: 2,
            relationship: &r,
            preferences: &prefs,
            memory_block: "# Long-Term Memory (summary)\n",
            history: &h,
            user_text: "我想更靠近你",
            now: Utc::now(),
        };
        let safe = SafePromptBuilder.build(&ctx);
        let creative = CreativePromptBuilder.build(&ctx);

        assert_eq!(safe.first(), creative.first());
        assert_eq!(safe.last(), creative.last());
        assert_eq!(safe.last().unwrap().content, "我想更靠近你");
        assert_eq!(safe[0].role, crate::llm::ChatRole::System);
        assert_eq!(safe[1].role, crate::llm::ChatRole::System);
        assert_ne!(safe[1], creative[1]);

        assert_eq!(safe.len(), 2 + SAFE_HISTORY_LIMIT + 1);
        assert_eq!(creative.len(), 2 + CREATIVE_HISTORY_LIMIT + 1);
        // History keeps the newest messages, oldest first.
        assert_eq!(safe[2].content, "第6句");
        assert_eq!(safe[safe.len() - 2].content, "第13句");
    }

    #[test]
    fn test_level_clamping() {
        assert_eq!(SafePromptBuilder.effective_level(5), 2);
        assert_eq!(SafePromptBuilder.effective_level(1), 1);
        assert_eq!(CreativePromptBuilder.effective_level(1), 3);
        assert_eq!(CreativePromptBuilder.effective_level(5), 5);

        for level in 1..=5 {
            let g = SafePromptBuilder.level_guidance(SafePromptBuilder.effective_level(level));
            assert!(!g.contains("L4") && !g.contains("L5"));
        }
        assert!(CreativePromptBuilder.level_guidance(4).contains("感官與詩意表達"));
        assert!(!CreativePromptBuilder.level_guidance(3).contains("感官與詩意表達"));
    }

    #[test]
    fn test_header_mentions_bounds_and_facts() {
        let header = system_header(&character(), ChatMode::Casual);
        assert!(header.contains("林知遠"));
        assert!(header.contains("150-250"));
        assert!(header.contains("醫生、溫柔"));
        assert!(header.contains("女性向互動要點"));

        let novel = system_header(&character(), ChatMode::Novel);
        assert!(novel.contains("400-500"));
    }

    #[test]
    fn test_welcome_adds_instruction() {
        let c = character();
        let r = relationship();
        let prefs = UserPreferences::default();
        let ctx = PromptContext {
            character: &c,
            chat_mode: ChatMode::Casual,
            level: 1,
            relationship: &r,
            preferences: &prefs,
            memory_block: "",
            history: &[],
            user_text: WELCOME_SENTINEL,
            now: Utc::now(),
        };
        let msgs = SafePromptBuilder.build(&ctx);
        assert_eq!(msgs.len(), 3);
        assert!(msgs[1].content.contains("初次見面"));
    }

    #[test]
    fn test_schema_shape() {
        let s = response_schema(ChatMode::Casual);
        assert_eq!(s["schema"]["properties"]["content"]["minLength"], 150);
        assert_eq!(
            s["schema"]["properties"]["emotion_delta"]["properties"]["affection_change"]["maximum"],
            5
        );
        assert_eq!(s["schema"]["properties"]["mood"]["enum"].as_array().unwrap().len(), 14);
        // Tiers follow affection, so the model is not asked for them.
        assert!(s["schema"]["properties"].get("relationship").is_none());
        assert_eq!(s["schema"]["required"], json!(["content", "emotion_delta", "mood"]));
    }

    #[test]
    fn test_time_context_uses_taipei() {
        let noon_utc = DateTime::parse_from_rfc3339("2025-01-01T04:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t = time_context(noon_utc);
        assert!(t.contains("12:30"));
        assert!(t.contains("下午"));
    }
}
