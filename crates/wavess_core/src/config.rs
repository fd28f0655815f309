use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WavessConfig {
    #[serde(deserialize_with = "safe_provider")]
    pub safe_provider: ProviderConfig,
    #[serde(deserialize_with = "creative_provider")]
    pub creative_provider: ProviderConfig,
    pub engine: EngineConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub deployment: DeploymentConfig,
    pub classifier: ClassifierConfig,
}

impl Default for WavessConfig {
    fn default() -> Self {
        Self {
            safe_provider: ProviderConfig::safe_default(),
            creative_provider: ProviderConfig::creative_default(),
            engine: EngineConfig::default(),
            memory: MemoryConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            deployment: DeploymentConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl WavessConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: WavessConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if the file is missing or invalid, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    pub fn apply_env_overrides(&mut self) {
        self.safe_provider.apply_env("OPENAI");
        self.creative_provider.apply_env("GROK");

        if let Ok(v) = std::env::var("NSFW_EMBED_MODEL") {
            if !v.is_empty() {
                self.classifier.embed_model = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LEXICON_PATH") {
            self.classifier.lexicon_path = Some(v);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.store.database_path = v;
        }
        let env = std::env::var("WAVESS_ENV").or_else(|_| std::env::var("GO_ENV"));
        if let Ok(v) = env {
            self.deployment.mode = DeploymentMode::from_env_value(&v);
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

/// One OpenAI-compatible chat-completion endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Label used in logs.
    pub name: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn safe_default() -> Self {
        Self {
            name: "openai".to_string(),
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 1200,
            temperature: 0.8,
            timeout_secs: 60,
        }
    }

    pub fn creative_default() -> Self {
        Self {
            name: "grok".to_string(),
            api_key: None,
            base_url: "https://api.x.ai/v1".to_string(),
            model: "grok-3".to_string(),
            max_tokens: 2000,
            temperature: 0.9,
            timeout_secs: 60,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn apply_env(&mut self, prefix: &str) {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        if let Some(v) = var("API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = var("API_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("MODEL") {
            self.model = v;
        }
        if let Some(n) = var("MAX_TOKENS").and_then(|v| v.parse().ok()) {
            self.max_tokens = n;
        }
        if let Some(n) = var("TEMPERATURE").and_then(|v| v.parse().ok()) {
            self.temperature = n;
        }
    }
}

/// Keys present in a `[*_provider]` table; absent keys keep the provider's defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ProviderTable {
    name: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

impl ProviderTable {
    fn over(self, base: ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            name: self.name.unwrap_or(base.name),
            api_key: self.api_key.or(base.api_key),
            base_url: self.base_url.unwrap_or(base.base_url),
            model: self.model.unwrap_or(base.model),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
        }
    }
}

fn safe_provider<'de, D: Deserializer<'de>>(d: D) -> Result<ProviderConfig, D::Error> {
    Ok(ProviderTable::deserialize(d)?.over(ProviderConfig::safe_default()))
}

fn creative_provider<'de, D: Deserializer<'de>>(d: D) -> Result<ProviderConfig, D::Error> {
    Ok(ProviderTable::deserialize(d)?.over(ProviderConfig::creative_default()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard deadline for one provider call.
    pub provider_timeout_secs: u64,
    /// Messages read from the store per turn.
    pub history_limit: usize,
    /// Extra attempts on the same provider after a 5xx.
    pub provider_retries: u32,
    /// Repair round trips after an unparsable reply.
    pub schema_repair_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 60,
            history_limit: 25,
            provider_retries: 1,
            schema_repair_attempts: 1,
        }
    }
}

impl EngineConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Short-term entries older than this are dropped on the next sweep.
    pub short_term_max_age_hours: i64,
    pub short_term_capacity: usize,
    /// Minimum gap between sweeps of stale memory and idle per-chat state.
    /// A turn that finds the gap elapsed runs the sweep first.
    pub cleanup_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_max_age_hours: 24,
            short_term_capacity: crate::memory::SHORT_TERM_CAPACITY,
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub relationship_ttl_secs: u64,
    /// Total admitted cost across all entries.
    pub max_cost: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            relationship_ttl_secs: 30,
            max_cost: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: String,
    pub max_connections: u32,
    /// Retries for busy/locked/connection errors.
    pub transient_retries: u32,
    /// Where `create-migration` writes new files.
    pub migrations_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: "wavess.db".to_string(),
            max_connections: 5,
            transient_retries: 2,
            migrations_dir: "migrations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    Development,
    Production,
}

impl DeploymentMode {
    fn from_env_value(v: &str) -> Self {
        if v.eq_ignore_ascii_case("production") || v.eq_ignore_ascii_case("prod") {
            DeploymentMode::Production
        } else {
            DeploymentMode::Development
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub mode: DeploymentMode,
}

impl DeploymentConfig {
    /// Prompt bodies are only logged outside production.
    pub fn log_prompts(&self) -> bool {
        self.mode != DeploymentMode::Production
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Replaces the built-in lexicon table when set.
    pub lexicon_path: Option<String>,
    /// Accepted for compatibility; only the keyword pathway is implemented.
    pub embed_model: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = WavessConfig::default();
        assert_eq!(cfg.safe_provider.model, "gpt-4o");
        assert_eq!(cfg.safe_provider.max_tokens, 1200);
        assert_eq!(cfg.creative_provider.model, "grok-3");
        assert_eq!(cfg.creative_provider.base_url, "https://api.x.ai/v1");
        assert_eq!(cfg.engine.provider_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.engine.history_limit, 25);
        assert_eq!(cfg.cache.relationship_ttl_secs, 30);
        assert_eq!(cfg.memory.cleanup_interval_secs, 3600);
        assert!(cfg.deployment.log_prompts());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
[creative_provider]
model = "grok-4"
"#;
        let cfg: WavessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.creative_provider.model, "grok-4");
        // Unspecified keys keep the creative defaults
        assert_eq!(cfg.creative_provider.max_tokens, 2000);
        assert_eq!(cfg.creative_provider.base_url, "https://api.x.ai/v1");
        assert_eq!(cfg.safe_provider.model, "gpt-4o");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[safe_provider]
name = "openai"
base_url = "http://localhost:8080/v1"
model = "gpt-4.1-mini"
max_tokens = 800
temperature = 0.5

[engine]
provider_timeout_secs = 10
history_limit = 40

[memory]
short_term_max_age_hours = 6
cleanup_interval_secs = 60

[store]
database_path = "data/wavess.db"
transient_retries = 3

[deployment]
mode = "production"

[classifier]
lexicon_path = "lexicons.toml"
"#;
        let cfg: WavessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.safe_provider.base_url, "http://localhost:8080/v1");
        assert_eq!(cfg.safe_provider.max_tokens, 800);
        assert_eq!(cfg.engine.history_limit, 40);
        assert_eq!(cfg.memory.short_term_max_age_hours, 6);
        assert_eq!(cfg.memory.cleanup_interval_secs, 60);
        assert_eq!(cfg.memory.short_term_capacity, 5);
        assert_eq!(cfg.store.database_path, "data/wavess.db");
        assert_eq!(cfg.deployment.mode, DeploymentMode::Production);
        assert!(!cfg.deployment.log_prompts());
        assert_eq!(cfg.classifier.lexicon_path.as_deref(), Some("lexicons.toml"));
    }

    #[test]
    fn test_env_overrides_and_defaults() {
        // Part 1: env overrides
        std::env::set_var("GROK_MODEL", "grok-3-mini");
        std::env::set_var("GROK_MAX_TOKENS", "1500");
        std::env::set_var("GO_ENV", "production");

        let mut cfg = WavessConfig::default();
        cfg.apply_env_overrides();

        assert_eq!(cfg.creative_provider.model, "grok-3-mini");
        assert_eq!(cfg.creative_provider.max_tokens, 1500);
        assert_eq!(cfg.deployment.mode, DeploymentMode::Production);

        std::env::remove_var("GROK_MODEL");
        std::env::remove_var("GROK_MAX_TOKENS");
        std::env::remove_var("GO_ENV");

        // Part 2: nonexistent path returns defaults
        let cfg = WavessConfig::load_or_default("/nonexistent/path.toml");
        assert_eq!(cfg.creative_provider.model, "grok-3");
    }
}
