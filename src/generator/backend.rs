//! Completion backend seam. The generator talks to the model through the
//! `CompletionBackend` trait so tests can substitute a canned backend and the
//! wire client stays swappable for any OpenAI-compatible endpoint.

use serde::{Deserialize, Serialize};

use super::GenerateError;

#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Submit a system + user prompt pair and return the raw completion text.
    async fn complete(&self, system_prompt: &str, user_prompt: &str)
        -> Result<String, GenerateError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatBackend {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl ChatBackend {
    pub fn new(api_base: String, api_key: String, model: String, timeout_ms: u64) -> Self {
        let timeout = std::time::Duration::from_millis(timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_base,
            api_key,
            model,
        }
    }
}

#[async_trait::async_trait]
impl CompletionBackend for ChatBackend {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, GenerateError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.3,
        };
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Upstream(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GenerateError::Upstream(format!(
                "completion API returned status {}",
                status.as_u16()
            )));
        }
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerateError::Upstream(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerateError::Upstream("completion response contained no choices".into()))
    }
}
