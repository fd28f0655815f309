use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Parameters for one completion call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub model: String,
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Opaque end-user tag, used upstream for rate-limit sharding.
    pub user: Option<String>,
    /// `json_schema` response format body, if structured output is requested.
    pub response_schema: Option<Value>,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tokens: 1200,
            temperature: 0.8,
            user: None,
            response_schema: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub model: String,
    pub finish_reason: Option<String>,
    pub cost_usd: f64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name used in logs ("openai", "grok", ...).
    fn name(&self) -> &str;

    /// Defaults for this client's configured model.
    fn default_params(&self) -> GenerateParams;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> Result<Completion, ProviderError>;
}
