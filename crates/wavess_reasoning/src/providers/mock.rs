//! Scripted LLM client: deterministic responses for tests and offline runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::llm::{ChatMessage, Completion, GenerateParams, LlmClient};

/// One scripted step.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(MockFailure),
    /// Sleep first, then yield the inner reply. Long delays stand in for hangs.
    Delayed(Duration, Box<MockReply>),
}

/// `ProviderError` is not `Clone`; this is the scriptable subset.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Server(u16),
    Client(u16),
    Policy,
    Transport,
}

impl MockFailure {
    fn to_error(&self) -> ProviderError {
        match self {
            MockFailure::Server(status) => ProviderError::Server {
                status: *status,
                body: "upstream failure".to_string(),
            },
            MockFailure::Client(status) => ProviderError::Client {
                status: *status,
                body: "bad request".to_string(),
            },
            MockFailure::Policy => ProviderError::Policy("content policy".to_string()),
            MockFailure::Transport => ProviderError::Transport("connection reset".to_string()),
        }
    }
}

/// Pops one scripted reply per call. An exhausted queue repeats the fallback.
pub struct MockLlmClient {
    name: String,
    model: String,
    replies: Mutex<VecDeque<MockReply>>,
    fallback: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlmClient {
    pub fn new(name: &str, replies: Vec<MockReply>) -> Self {
        Self {
            name: name.to_string(),
            model: format!("{}-mock", name),
            replies: Mutex::new(replies.into()),
            fallback: String::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `text`.
    pub fn with_text(name: &str, text: &str) -> Self {
        let mut mock = Self::new(name, Vec::new());
        mock.fallback = text.to_string();
        mock
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.to_string();
        self
    }

    pub async fn push(&self, reply: MockReply) {
        self.replies.lock().await.push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every message list this client was called with, in call order.
    pub async fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_params(&self) -> GenerateParams {
        GenerateParams {
            model: self.model.clone(),
            ..Default::default()
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerateParams,
    ) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(messages.to_vec());
        let next = self.replies.lock().await.pop_front();

        let mut reply = next.unwrap_or_else(|| MockReply::Text(self.fallback.clone()));
        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Error(f) => return Err(f.to_error()),
                MockReply::Text(content) => {
                    let prompt_tokens = messages.iter().map(|m| m.content.chars().count()).sum::<usize>() as u32;
                    return Ok(Completion {
                        completion_tokens: content.chars().count() as u32,
                        content,
                        prompt_tokens,
                        model: params.model.clone(),
                        finish_reason: Some("stop".to_string()),
                        cost_usd: 0.0,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_pops_in_order() {
        let mock = MockLlmClient::new(
            "openai",
            vec![
                MockReply::Text("first".into()),
                MockReply::Error(MockFailure::Server(502)),
            ],
        )
        .with_fallback("again");
        let params = mock.default_params();
        let msgs = [ChatMessage::user("hi")];

        assert_eq!(mock.generate(&msgs, &params).await.unwrap().content, "first");
        assert!(mock.generate(&msgs, &params).await.unwrap_err().is_server());
        assert_eq!(mock.generate(&msgs, &params).await.unwrap().content, "again");
        assert_eq!(mock.calls(), 3);
        assert_eq!(mock.requests().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_reply_honours_sleep() {
        let mock = MockLlmClient::new(
            "grok",
            vec![MockReply::Delayed(
                Duration::from_secs(70),
                Box::new(MockReply::Text("late".into())),
            )],
        );
        let params = mock.default_params();
        let out = tokio::time::timeout(
            Duration::from_secs(60),
            mock.generate(&[ChatMessage::user("hi")], &params),
        )
        .await;
        assert!(out.is_err());
    }
}
