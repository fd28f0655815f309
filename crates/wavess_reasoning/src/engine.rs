//! Turn orchestrator: one user utterance in, one persisted character reply out.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use wavess_core::config::{EngineConfig, WavessConfig};
use wavess_core::consistency::ConsistencyChecker;
use wavess_core::conversation::ConversationClassifier;
use wavess_core::emotion::{combine_deltas, EmotionManager, SpecialEvent, AFFECTION_MAX, AFFECTION_MIN};
use wavess_core::memory::LongTermMemory;
use wavess_core::models::{
    Character, ChatMode, Engine, IntimacyTier, Message, Mood, Relationship, RelationshipTier, Role,
    UserPreferences,
};
use wavess_core::retry::{with_retry, RetryConfig};
use wavess_core::router::{filter_history, EngineRouter, RouteDecision, RouteInput, RouteReason};
use wavess_core::{ContentClassifier, Lexicon, Store, TurnWrite};
use wavess_memory::{EngineCache, MemoryManager};

use crate::error::{ProviderError, TurnError};
use crate::llm::{ChatMessage, Completion, GenerateParams, LlmClient};
use crate::parse::{check_length, parse_reply, CharacterReply, LengthCheck};
use crate::pricing::PricingTable;
use crate::prompts::{builder_for, repair_messages, response_schema, PromptContext, WELCOME_SENTINEL};
use crate::providers::OpenAiCompatClient;

/// Reply persisted instead of calling a provider when a hard trigger fires.
pub const HARD_REFUSAL_REPLY: &str = "抱歉，該請求涉及依法禁止的內容，無法提供回應。請更換其他話題。";

// ============================================================================
// Requests and results
// ============================================================================

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub chat_id: String,
    pub user_id: String,
    pub character_id: String,
    pub user_text: String,
    /// Caller-chosen id for the user message. Retrying with the same id
    /// returns the already committed reply.
    pub user_message_id: Option<String>,
    /// Used when the chat does not exist yet.
    pub chat_mode: ChatMode,
    pub preferences: UserPreferences,
}

impl TurnRequest {
    pub fn new(chat_id: &str, user_id: &str, character_id: &str, user_text: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            user_text: user_text.to_string(),
            user_message_id: None,
            chat_mode: ChatMode::Casual,
            preferences: UserPreferences::default(),
        }
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.user_message_id = Some(id.to_string());
        self
    }

    pub fn with_mode(mut self, mode: ChatMode) -> Self {
        self.chat_mode = mode;
        self
    }

    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub message_id: String,
    pub content: String,
    pub mood: Mood,
    pub affection: u8,
    pub relationship: RelationshipTier,
    pub intimacy: IntimacyTier,
    pub engine: Engine,
    pub level: u8,
    pub latency_ms: u64,
    pub special_event: Option<SpecialEvent>,
}

impl TurnResult {
    fn from_parts(
        message: &Message,
        relationship: &Relationship,
        engine: Engine,
        level: u8,
        started: Instant,
        special_event: Option<SpecialEvent>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            content: message.content.clone(),
            mood: relationship.mood,
            affection: relationship.affection,
            relationship: relationship.relationship,
            intimacy: relationship.intimacy,
            engine,
            level,
            latency_ms: started.elapsed().as_millis() as u64,
            special_event,
        }
    }
}

/// Routing and guidance level after user preferences. The classified level is
/// still what gets stored on the message.
pub fn capped_level(preferences: &UserPreferences, level: u8) -> u8 {
    if !preferences.nsfw_enabled {
        1
    } else {
        level.min(preferences.max_nsfw_level.max(1))
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Strictly after `after`, and not before `now`.
fn next_timestamp(now: DateTime<Utc>, after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match after {
        Some(prev) => now.max(prev + ChronoDuration::microseconds(1)),
        None => now,
    }
}

// ============================================================================
// Generation plumbing
// ============================================================================

/// Everything needed to build a prompt for either engine.
struct GenerationInput<'a> {
    chat_id: &'a str,
    user_id: &'a str,
    character: &'a Character,
    chat_mode: ChatMode,
    level: u8,
    relationship: &'a Relationship,
    preferences: &'a UserPreferences,
    long_term: Option<&'a LongTermMemory>,
    /// Off for the welcome turn, which has nothing to remember yet.
    with_memory: bool,
    /// Unfiltered, oldest first.
    history: &'a [Message],
    user_text: &'a str,
    now: DateTime<Utc>,
    /// Policy refusals from the safe engine may move the chat to creative.
    allow_escalation: bool,
}

struct Generation {
    reply: CharacterReply,
    completion: Completion,
    decision: RouteDecision,
}

pub struct TurnOrchestrator {
    store: Arc<dyn Store>,
    safe: Arc<dyn LlmClient>,
    creative: Arc<dyn LlmClient>,
    classifier: ContentClassifier,
    router: EngineRouter,
    emotion: EmotionManager,
    consistency: ConsistencyChecker,
    memory: MemoryManager,
    cache: EngineCache,
    settings: EngineConfig,
    log_prompts: bool,
    chat_locks: DashMap<String, Arc<Mutex<()>>>,
    sweep_interval_secs: i64,
    /// Unix seconds of the last sweep.
    last_sweep: AtomicI64,
}

impl TurnOrchestrator {
    pub fn new(
        config: &WavessConfig,
        lexicon: &Lexicon,
        store: Arc<dyn Store>,
        safe: Arc<dyn LlmClient>,
        creative: Arc<dyn LlmClient>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            safe,
            creative,
            classifier: ContentClassifier::new(&lexicon.content)?,
            router: EngineRouter::new(ConversationClassifier::new(&lexicon.conversation)),
            emotion: EmotionManager::new(&lexicon.emotion),
            consistency: ConsistencyChecker::new(),
            memory: MemoryManager::new(&config.memory),
            cache: EngineCache::new(
                config.cache.max_cost,
                std::time::Duration::from_secs(config.cache.relationship_ttl_secs),
            ),
            settings: config.engine.clone(),
            log_prompts: config.deployment.log_prompts(),
            chat_locks: DashMap::new(),
            sweep_interval_secs: i64::try_from(config.memory.cleanup_interval_secs).unwrap_or(i64::MAX),
            last_sweep: AtomicI64::new(Utc::now().timestamp()),
        })
    }

    /// Wire the two HTTP providers from config. Refusal text is only treated
    /// as a policy error on the safe provider.
    pub fn from_config(config: &WavessConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let lexicon = Lexicon::load_or_builtin(config.classifier.lexicon_path.as_deref())?;
        if let Some(model) = &config.classifier.embed_model {
            info!(model = %model, "Embedding classifier configured; using keyword classifier");
        }
        let pricing = PricingTable::default();
        let safe = OpenAiCompatClient::new(config.safe_provider.clone(), pricing.clone())?
            .with_refusal_detection(true);
        let creative = OpenAiCompatClient::new(config.creative_provider.clone(), pricing)?;
        Self::new(config, &lexicon, store, Arc::new(safe), Arc::new(creative))
    }

    pub fn router(&self) -> &EngineRouter {
        &self.router
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn emotion(&self) -> &EmotionManager {
        &self.emotion
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    fn client(&self, engine: Engine) -> &dyn LlmClient {
        match engine {
            Engine::Safe => self.safe.as_ref(),
            Engine::Creative => self.creative.as_ref(),
        }
    }

    fn chat_lock(&self, chat_id: &str) -> Arc<Mutex<()>> {
        self.chat_locks.entry(chat_id.to_string()).or_default().clone()
    }

    /// Chats with a lock entry: remembered or mid-turn.
    pub fn tracked_chats(&self) -> usize {
        self.chat_locks.len()
    }

    /// Drop stale short-term memory, then the lock and sticky entries of
    /// chats that are neither remembered nor mid-turn. A dropped sticky flag
    /// comes back from the relationship row on the chat's next turn.
    /// Returns the chats that left short-term memory.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let swept = self.memory.cleanup(now);
        self.chat_locks
            .retain(|chat_id, lock| Arc::strong_count(lock) > 1 || self.memory.contains(chat_id));
        let routes = self
            .router
            .retain(|chat_id| self.chat_locks.contains_key(chat_id));
        debug!(
            swept = swept.len(),
            locks = self.chat_locks.len(),
            routes,
            "Swept idle chat state"
        );
        swept
    }

    /// Run `sweep` if the configured interval has passed. Only one caller
    /// per interval wins.
    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.timestamp().saturating_sub(last) < self.sweep_interval_secs {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now.timestamp(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.sweep(now);
        }
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    async fn load_character(&self, id: &str) -> Result<Character, TurnError> {
        if let Some(c) = self.cache.get_character(id) {
            return Ok(c);
        }
        let character = self
            .store
            .get_character(id)
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| TurnError::InvalidInput(format!("unknown or inactive character: {}", id)))?;
        self.cache.put_character(&character);
        Ok(character)
    }

    /// Per-chat relationship row. A missing row is seeded in memory only; it
    /// reaches the store with the turn's commit.
    async fn load_relationship(
        &self,
        user_id: &str,
        character_id: &str,
        chat_id: &str,
    ) -> Result<(Relationship, bool), TurnError> {
        if let Some(r) = self.cache.get_relationship(user_id, character_id, Some(chat_id)) {
            return Ok((r, false));
        }
        match self.store.get_relationship(user_id, character_id, Some(chat_id)).await? {
            Some(r) => {
                self.cache.put_relationship(&r);
                Ok((r, false))
            }
            None => Ok((
                self.emotion.new_relationship(user_id, character_id, Some(chat_id)),
                true,
            )),
        }
    }

    async fn load_long_term(
        &self,
        user_id: &str,
        character_id: &str,
    ) -> Result<Option<LongTermMemory>, TurnError> {
        if let Some(global) = self.cache.get_relationship(user_id, character_id, None) {
            return Ok(global.emotion_data.long_term_memory);
        }
        let global = self.store.get_relationship(user_id, character_id, None).await?;
        Ok(global.and_then(|g| {
            self.cache.put_relationship(&g);
            g.emotion_data.long_term_memory
        }))
    }

    // ------------------------------------------------------------------
    // Provider calls
    // ------------------------------------------------------------------

    /// One provider call under the deadline, retried on 5xx only.
    async fn call_provider(
        &self,
        client: &dyn LlmClient,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> Result<Completion, ProviderError> {
        let deadline = self.settings.provider_timeout();
        let secs = self.settings.provider_timeout_secs;
        let retry = RetryConfig::with_retries(self.settings.provider_retries);
        with_retry(&retry, client.name(), ProviderError::is_server, move || async move {
            match tokio::time::timeout(deadline, client.generate(messages, params)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(provider = client.name(), timeout_secs = secs, "Provider deadline exceeded");
                    Err(ProviderError::Timeout(secs))
                }
            }
        })
        .await
    }

    /// Build, call, parse, and repair once on an unparsable reply.
    async fn attempt(
        &self,
        input: &GenerationInput<'_>,
        engine: Engine,
    ) -> Result<(CharacterReply, Completion), TurnError> {
        let builder = builder_for(engine);
        let history = filter_history(engine, input.history);
        let memory_block = if input.with_memory {
            // Recent-context summaries follow the same level cut as history.
            let max_level = builder.effective_level(5);
            self.memory
                .memory_prompt(input.chat_id, input.long_term, max_level)
        } else {
            String::new()
        };
        let ctx = PromptContext {
            character: input.character,
            chat_mode: input.chat_mode,
            level: input.level,
            relationship: input.relationship,
            preferences: input.preferences,
            memory_block: &memory_block,
            history: &history,
            user_text: input.user_text,
            now: input.now,
        };
        let mut messages = builder.build(&ctx);
        if self.log_prompts {
            debug!(chat_id = input.chat_id, engine = %engine, prompt = ?messages, "Prompt built");
        }

        let client = self.client(engine);
        let params = GenerateParams {
            user: Some(input.user_id.to_string()),
            response_schema: Some(response_schema(input.chat_mode)),
            ..client.default_params()
        };

        let mut completion = self.call_provider(client, &messages, &params).await?;
        let mut repairs = 0;
        loop {
            match parse_reply(&completion.content) {
                Ok(reply) => return Ok((reply, completion)),
                Err(failure) if repairs < self.settings.schema_repair_attempts => {
                    repairs += 1;
                    warn!(
                        chat_id = input.chat_id,
                        engine = %engine,
                        reason = %failure.reason,
                        "Unparsable reply, requesting repair"
                    );
                    messages = repair_messages(&messages, &completion.content);
                    completion = self.call_provider(client, &messages, &params).await?;
                }
                Err(failure) => {
                    error!(
                        chat_id = input.chat_id,
                        engine = %engine,
                        raw = %completion.content,
                        reason = %failure.reason,
                        "Reply failed schema validation"
                    );
                    return Err(TurnError::SchemaViolation {
                        reason: failure.reason,
                        raw: completion.content,
                    });
                }
            }
        }
    }

    /// Run the routed engine; a policy refusal on the safe engine escalates
    /// to creative and retries once with unfiltered history. The returned
    /// decision carries the sticky state to apply if the turn commits.
    async fn generate(
        &self,
        input: &GenerationInput<'_>,
        decision: RouteDecision,
    ) -> Result<Generation, TurnError> {
        match self.attempt(input, decision.engine).await {
            Ok((reply, completion)) => Ok(Generation {
                reply,
                completion,
                decision,
            }),
            Err(TurnError::Provider(ProviderError::Policy(reason)))
                if decision.engine == Engine::Safe && input.allow_escalation =>
            {
                warn!(chat_id = input.chat_id, reason = %reason, "Safe provider refused; escalating");
                let escalated = self.router.escalate(input.chat_id);
                let (reply, completion) = self.attempt(input, escalated.engine).await?;
                Ok(Generation {
                    reply,
                    completion,
                    decision: escalated,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn log_length(&self, chat_id: &str, content: &str, mode: ChatMode) {
        let (chars, check) = check_length(content, mode);
        let (min, max) = mode.word_bounds();
        match check {
            LengthCheck::Within => {}
            c if c.is_severe() => {
                error!(chat_id, chars, min, max, "Reply length far outside chat-mode bounds")
            }
            _ => warn!(chat_id, chars, min, max, "Reply length outside chat-mode bounds"),
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Process one user message end to end. Turns on the same chat are
    /// serialized; the user and assistant messages, relationship update and
    /// emotion snapshot are committed together or not at all.
    pub async fn process_message(&self, req: TurnRequest) -> Result<TurnResult, TurnError> {
        let started = Instant::now();
        if req.chat_id.is_empty() || req.user_id.is_empty() || req.character_id.is_empty() {
            return Err(TurnError::InvalidInput(
                "chat_id, user_id and character_id are required".to_string(),
            ));
        }

        self.maybe_sweep(Utc::now());
        let lock = self.chat_lock(&req.chat_id);
        let _guard = lock.lock().await;

        if let Some(mid) = &req.user_message_id {
            if let Some(reply) = self.store.find_reply(mid).await? {
                info!(chat_id = %req.chat_id, user_message_id = %mid, "Duplicate turn, returning committed reply");
                return self.replay(&req, mid, reply, started).await;
            }
        }

        // Classify and allocate ids.
        let classification = self.classifier.classify(&req.user_text);
        let level = classification.level;
        let user_mid = req.user_message_id.clone().unwrap_or_else(new_id);
        let assistant_mid = new_id();

        let chat = self
            .store
            .ensure_chat_exists(&req.chat_id, &req.user_id, &req.character_id, req.chat_mode)
            .await?;
        let character = self.load_character(&req.character_id).await?;

        let history = self
            .store
            .get_recent_messages(&req.chat_id, self.settings.history_limit)
            .await?;
        let now = Utc::now();
        let user_message = Message {
            id: user_mid.clone(),
            chat_id: req.chat_id.clone(),
            role: Role::User,
            content: req.user_text.clone(),
            nsfw_level: level,
            ai_engine: None,
            reply_to: None,
            created_at: next_timestamp(now, history.last().map(|m| m.created_at)),
        };

        // Load state.
        let (relationship, _seeded) = self
            .load_relationship(&req.user_id, &req.character_id, &req.chat_id)
            .await?;
        let long_term = self.load_long_term(&req.user_id, &req.character_id).await?;
        self.memory.seed_from_history(&req.chat_id, &history);

        if classification.hard {
            return self
                .refuse(&req, user_message, assistant_mid, &relationship, started)
                .await;
        }

        // Route.
        self.router
            .restore(&req.chat_id, relationship.emotion_data.nsfw_sticky);
        let guided_level = capped_level(&req.preferences, level);
        let decision = if req.preferences.nsfw_enabled {
            self.router.route(&RouteInput {
                user_message: &req.user_text,
                chat_id: &req.chat_id,
                level: guided_level,
                affection: relationship.affection,
                intimacy: relationship.intimacy,
                adult_character: character.is_adult(),
            })
        } else {
            RouteDecision {
                engine: Engine::Safe,
                reason: RouteReason::Default,
                sticky: self.router.is_sticky(&req.chat_id),
            }
        };

        // Prompt, provider, parse.
        let input = GenerationInput {
            chat_id: &req.chat_id,
            user_id: &req.user_id,
            character: &character,
            chat_mode: chat.chat_mode,
            level: guided_level,
            relationship: &relationship,
            preferences: &req.preferences,
            long_term: long_term.as_ref(),
            with_memory: true,
            history: &history,
            user_text: &req.user_text,
            now,
            allow_escalation: req.preferences.nsfw_enabled,
        };
        let generation = self.generate(&input, decision).await?;
        let engine = generation.decision.engine;
        let content = generation.reply.content.clone();
        self.log_length(&req.chat_id, &content, chat.chat_mode);
        if let Some(reasoning) = &generation.reply.reasoning {
            debug!(chat_id = %req.chat_id, reasoning = %reasoning, "Model reasoning");
        }

        let report = self.consistency.check_character(&character, &content);
        if !report.is_consistent {
            warn!(
                chat_id = %req.chat_id,
                character_id = %character.id,
                score = report.score,
                violations = report.violations.len(),
                "Reply drifted from character"
            );
        }

        // Emotion.
        let computed = self.emotion.compute_delta(&req.user_text, level);
        let delta = combine_deltas(Some(generation.reply.affection_change), computed);
        let raw_affection = relationship.affection as i32 + delta;
        if !(AFFECTION_MIN..=AFFECTION_MAX).contains(&raw_affection) {
            warn!(chat_id = %req.chat_id, raw_affection, "Affection out of range, clamping");
        }
        let mut update = self.emotion.apply_turn(
            &relationship,
            &req.user_text,
            level,
            delta,
            generation.reply.mood,
        );
        update.relationship.emotion_data.nsfw_sticky = generation.decision.sticky;

        // Memory.
        let memory_update = self.memory.prepare(
            &req.chat_id,
            &req.user_id,
            &req.character_id,
            long_term.as_ref(),
            &req.user_text,
            &content,
            level,
            update.relationship.affection,
            now,
        );

        // Commit.
        let assistant_message = Message {
            id: assistant_mid,
            chat_id: req.chat_id.clone(),
            role: Role::Assistant,
            content,
            nsfw_level: level,
            ai_engine: Some(engine),
            reply_to: Some(user_mid),
            created_at: next_timestamp(Utc::now(), Some(user_message.created_at)),
        };
        let write = TurnWrite {
            user_message: Some(user_message),
            assistant_message: Some(assistant_message.clone()),
            relationship: Some(update.relationship.clone()),
            snapshot: Some(update.snapshot.clone()),
            long_term_memory: memory_update
                .long_term_changed
                .then(|| memory_update.additions.clone()),
            milestones: update.milestones.clone(),
        };
        let outcome = self.store.commit_turn(&write).await?;

        // Durable from here on.
        self.router
            .set_sticky(&req.chat_id, generation.decision.sticky);
        update.confirm_milestones(&outcome.new_milestones);
        let special_event = update.headline_event();
        self.memory.apply(&memory_update);
        self.emotion.record_snapshot(update.snapshot.clone());
        self.cache.put_relationship(&update.relationship);
        if memory_update.long_term_changed || !outcome.new_milestones.is_empty() {
            self.cache
                .invalidate_relationship(&req.user_id, &req.character_id, None);
        }

        let result = TurnResult::from_parts(
            &assistant_message,
            &update.relationship,
            engine,
            level,
            started,
            special_event,
        );
        info!(
            chat_id = %req.chat_id,
            level,
            engine = %engine,
            route = ?generation.decision.reason,
            sticky = update.relationship.emotion_data.nsfw_sticky,
            affection = result.affection,
            delta = update.delta,
            model = %generation.completion.model,
            cost_usd = generation.completion.cost_usd,
            latency_ms = result.latency_ms,
            "Turn completed"
        );
        Ok(result)
    }

    /// Result for a user message that already has a committed reply.
    async fn replay(
        &self,
        req: &TurnRequest,
        user_mid: &str,
        reply: Message,
        started: Instant,
    ) -> Result<TurnResult, TurnError> {
        let level = self
            .store
            .get_message(user_mid)
            .await?
            .map(|m| m.nsfw_level)
            .unwrap_or(reply.nsfw_level);
        let (relationship, _) = self
            .load_relationship(&req.user_id, &req.character_id, &req.chat_id)
            .await?;
        Ok(TurnResult::from_parts(
            &reply,
            &relationship,
            reply.ai_engine.unwrap_or(Engine::Safe),
            level,
            started,
            None,
        ))
    }

    /// Persist the user turn with the fixed refusal, leaving state untouched.
    async fn refuse(
        &self,
        req: &TurnRequest,
        user_message: Message,
        assistant_mid: String,
        relationship: &Relationship,
        started: Instant,
    ) -> Result<TurnResult, TurnError> {
        warn!(chat_id = %req.chat_id, "Hard trigger matched, refusing without provider call");
        let assistant_message = Message {
            id: assistant_mid,
            chat_id: req.chat_id.clone(),
            role: Role::Assistant,
            content: HARD_REFUSAL_REPLY.to_string(),
            nsfw_level: 1,
            ai_engine: Some(Engine::Safe),
            reply_to: Some(user_message.id.clone()),
            created_at: next_timestamp(Utc::now(), Some(user_message.created_at)),
        };
        let level = user_message.nsfw_level;
        self.store
            .commit_turn(&TurnWrite {
                user_message: Some(user_message),
                assistant_message: Some(assistant_message.clone()),
                ..Default::default()
            })
            .await?;
        Ok(TurnResult::from_parts(
            &assistant_message,
            relationship,
            Engine::Safe,
            level,
            started,
            None,
        ))
    }

    /// First greeting of a new chat, generated by the safe engine at L1.
    /// Only the assistant message is stored. Calling it again on a chat that
    /// already opened with a greeting returns that greeting.
    pub async fn process_welcome(
        &self,
        chat_id: &str,
        user_id: &str,
        character_id: &str,
        chat_mode: ChatMode,
    ) -> Result<TurnResult, TurnError> {
        let started = Instant::now();
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let chat = self
            .store
            .ensure_chat_exists(chat_id, user_id, character_id, chat_mode)
            .await?;
        let character = self.load_character(character_id).await?;
        let (relationship, seeded) = self.load_relationship(user_id, character_id, chat_id).await?;

        let existing = self.store.get_recent_messages(chat_id, 2).await?;
        match existing.as_slice() {
            [] => {}
            [greeting] if greeting.role == Role::Assistant && greeting.reply_to.is_none() => {
                return Ok(TurnResult::from_parts(
                    greeting,
                    &relationship,
                    Engine::Safe,
                    1,
                    started,
                    None,
                ));
            }
            _ => {
                return Err(TurnError::InvalidInput(format!(
                    "chat {} already has messages",
                    chat_id
                )))
            }
        }

        let preferences = UserPreferences::default();
        let input = GenerationInput {
            chat_id,
            user_id,
            character: &character,
            chat_mode: chat.chat_mode,
            level: 1,
            relationship: &relationship,
            preferences: &preferences,
            long_term: None,
            with_memory: false,
            history: &[],
            user_text: WELCOME_SENTINEL,
            now: Utc::now(),
            allow_escalation: false,
        };
        let (reply, completion) = self.attempt(&input, Engine::Safe).await?;
        self.log_length(chat_id, &reply.content, chat.chat_mode);

        let message = Message {
            id: new_id(),
            chat_id: chat_id.to_string(),
            role: Role::Assistant,
            content: reply.content,
            nsfw_level: 1,
            ai_engine: Some(Engine::Safe),
            reply_to: None,
            created_at: Utc::now(),
        };
        self.store
            .commit_turn(&TurnWrite {
                assistant_message: Some(message.clone()),
                relationship: seeded.then(|| relationship.clone()),
                ..Default::default()
            })
            .await?;
        if seeded {
            self.cache.put_relationship(&relationship);
        }

        info!(
            chat_id,
            character_id,
            model = %completion.model,
            cost_usd = completion.cost_usd,
            "Welcome message generated"
        );
        Ok(TurnResult::from_parts(&message, &relationship, Engine::Safe, 1, started, None))
    }

    /// Generate an alternative reply to the chat's latest user message.
    /// Nothing is persisted and relationship state is not touched; the
    /// returned `message_id` is fresh and unsaved.
    pub async fn regenerate(
        &self,
        chat_id: &str,
        user_id: &str,
        character_id: &str,
        preferences: &UserPreferences,
    ) -> Result<TurnResult, TurnError> {
        let started = Instant::now();
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| TurnError::InvalidInput(format!("unknown chat: {}", chat_id)))?;
        if chat.user_id != user_id || chat.character_id != character_id {
            return Err(TurnError::InvalidInput(format!(
                "chat {} does not belong to this user and character",
                chat_id
            )));
        }
        let character = self.load_character(character_id).await?;
        let history = self
            .store
            .get_recent_messages(chat_id, self.settings.history_limit)
            .await?;
        let last_user = history
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or_else(|| TurnError::InvalidInput("chat has no user message to answer".to_string()))?;
        let target = &history[last_user];
        let previous_engine = history[last_user + 1..]
            .iter()
            .find(|m| m.reply_to.as_deref() == Some(target.id.as_str()))
            .and_then(|m| m.ai_engine);

        let (relationship, _) = self.load_relationship(user_id, character_id, chat_id).await?;
        let long_term = self.load_long_term(user_id, character_id).await?;
        let guided_level = capped_level(preferences, target.nsfw_level);
        let engine = match previous_engine {
            Some(e) if preferences.nsfw_enabled || e == Engine::Safe => e,
            _ if !preferences.nsfw_enabled => Engine::Safe,
            _ if guided_level >= 3 || character.is_adult() => Engine::Creative,
            _ => Engine::Safe,
        };

        let input = GenerationInput {
            chat_id,
            user_id,
            character: &character,
            chat_mode: chat.chat_mode,
            level: guided_level,
            relationship: &relationship,
            preferences,
            long_term: long_term.as_ref(),
            with_memory: true,
            history: &history[..last_user],
            user_text: &target.content,
            now: Utc::now(),
            allow_escalation: false,
        };
        let (reply, completion) = self.attempt(&input, engine).await?;
        self.log_length(chat_id, &reply.content, chat.chat_mode);

        let preview = Message {
            id: new_id(),
            chat_id: chat_id.to_string(),
            role: Role::Assistant,
            content: reply.content,
            nsfw_level: target.nsfw_level,
            ai_engine: Some(engine),
            reply_to: Some(target.id.clone()),
            created_at: Utc::now(),
        };
        info!(chat_id, engine = %engine, cost_usd = completion.cost_usd, "Reply regenerated");
        Ok(TurnResult::from_parts(
            &preview,
            &relationship,
            engine,
            target.nsfw_level,
            started,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_level() {
        let mut prefs = UserPreferences::default();
        assert_eq!(capped_level(&prefs, 4), 4);
        prefs.max_nsfw_level = 2;
        assert_eq!(capped_level(&prefs, 4), 2);
        assert_eq!(capped_level(&prefs, 1), 1);
        prefs.nsfw_enabled = false;
        assert_eq!(capped_level(&prefs, 5), 1);
    }

    #[test]
    fn test_next_timestamp_is_strictly_after() {
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(5);
        assert!(next_timestamp(now, Some(later)) > later);
        assert_eq!(next_timestamp(later, Some(now)), later);
        assert_eq!(next_timestamp(now, None), now);
    }
}
