//! Chat-completions client for OpenAI-compatible endpoints (OpenAI, xAI).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use wavess_core::config::ProviderConfig;

use crate::error::ProviderError;
use crate::llm::{ChatMessage, Completion, GenerateParams, LlmClient};
use crate::pricing::PricingTable;

/// Reply text that means the provider declined, even with a 200.
const REFUSAL_PHRASES: &[&str] = &[
    "抱歉，我無法協助",
    "很抱歉，我無法",
    "i'm sorry, but i can't",
    "i cannot assist with that",
];

/// Error-body fragments that mark a 4xx as a content-policy rejection.
const POLICY_KEYWORDS: &[&str] = &[
    "content policy",
    "content filter",
    "safety system",
    "policy violation",
    "refused to generate",
    "inappropriate content",
];

pub fn is_refusal(content: &str) -> bool {
    let lower = content.to_lowercase().replace('’', "'");
    REFUSAL_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn mentions_policy(body: &str) -> bool {
    let lower = body.to_lowercase();
    POLICY_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    config: ProviderConfig,
    pricing: PricingTable,
    /// Treat refusal text in a successful reply as a policy error.
    detect_refusals: bool,
}

impl OpenAiCompatClient {
    pub fn new(config: ProviderConfig, pricing: PricingTable) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            config: ProviderConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            pricing,
            detect_refusals: false,
        })
    }

    pub fn with_refusal_detection(mut self, enabled: bool) -> Self {
        self.detect_refusals = enabled;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

/// Request body for `/chat/completions`.
pub fn build_body(messages: &[ChatMessage], params: &GenerateParams) -> Value {
    let mut body = json!({
        "model": params.model,
        "messages": messages,
        "max_tokens": params.max_tokens,
        "temperature": params.temperature,
    });
    if let Some(user) = &params.user {
        body["user"] = json!(user);
    }
    if let Some(schema) = &params.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": schema,
        });
    }
    body
}

/// Pull content, usage and cost out of a chat-completions response.
pub fn decode_response(
    body: &Value,
    requested_model: &str,
    pricing: &PricingTable,
) -> Result<Completion, ProviderError> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?;
    let message = &choice["message"];

    if let Some(refusal) = message["refusal"].as_str().filter(|r| !r.is_empty()) {
        return Err(ProviderError::Policy(refusal.to_string()));
    }

    let content = message["content"]
        .as_str()
        .ok_or_else(|| ProviderError::Decode("choice has no text content".to_string()))?
        .to_string();
    let model = body["model"]
        .as_str()
        .unwrap_or(requested_model)
        .to_string();
    let prompt_tokens = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let completion_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(Completion {
        cost_usd: pricing.cost(&model, prompt_tokens, completion_tokens),
        content,
        prompt_tokens,
        completion_tokens,
        model,
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
    })
}

fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        500..=599 => ProviderError::Server { status, body },
        _ if mentions_policy(&body) => ProviderError::Policy(body),
        _ => ProviderError::Client { status, body },
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn default_params(&self) -> GenerateParams {
        GenerateParams {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            user: None,
            response_schema: None,
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> Result<Completion, ProviderError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| ProviderError::Client {
            status: 401,
            body: format!("no API key configured for {}", self.config.name),
        })?;

        let url = format!("{}/chat/completions", self.config.base_url);
        let body = build_body(messages, params);
        debug!(provider = %self.config.name, model = %params.model, messages = messages.len(), "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.timeout_secs)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(provider = %self.config.name, status = status.as_u16(), "Provider returned error status");
            return Err(classify_status(status.as_u16(), text));
        }

        let json: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout_secs)
            } else {
                ProviderError::Decode(e.to_string())
            }
        })?;
        let completion = decode_response(&json, &params.model, &self.pricing)?;

        if self.detect_refusals && is_refusal(&completion.content) {
            return Err(ProviderError::Policy(completion.content));
        }

        info!(
            provider = %self.config.name,
            model = %completion.model,
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            cost_usd = completion.cost_usd,
            "Completion received"
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_carries_schema_and_user() {
        let params = GenerateParams {
            model: "gpt-4o".into(),
            max_tokens: 800,
            temperature: 0.7,
            user: Some("u1".into()),
            response_schema: Some(json!({"name": "reply", "schema": {"type": "object"}})),
        };
        let body = build_body(&[ChatMessage::system("sys"), ChatMessage::user("hi")], &params);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["user"], "u1");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "reply");
    }

    #[test]
    fn test_decode_usage_and_cost() {
        let body = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "{\"content\":\"嗨\"}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
        });
        let c = decode_response(&body, "gpt-4o", &PricingTable::default()).unwrap();
        assert_eq!(c.prompt_tokens, 1000);
        assert_eq!(c.finish_reason.as_deref(), Some("stop"));
        assert!((c.cost_usd - (0.0025 + 0.005)).abs() < 1e-9);
    }

    #[test]
    fn test_decode_refusal_field() {
        let body = json!({"choices": [{"message": {"content": null, "refusal": "I can't help with that."}}]});
        let err = decode_response(&body, "gpt-4o", &PricingTable::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Policy(_)));

        let empty = json!({"choices": []});
        assert!(matches!(
            decode_response(&empty, "gpt-4o", &PricingTable::default()),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(503, "overloaded".into()).is_server());
        assert!(matches!(
            classify_status(400, "Your request was rejected by our safety system".into()),
            ProviderError::Policy(_)
        ));
        assert!(matches!(
            classify_status(429, "rate limited".into()),
            ProviderError::Client { status: 429, .. }
        ));
    }

    #[test]
    fn test_refusal_phrases() {
        assert!(is_refusal("抱歉，我無法協助這個請求。"));
        assert!(is_refusal("I’m sorry, but I can’t continue this."));
        assert!(!is_refusal("我很樂意陪你聊天"));
    }
}
