//! LLM provider abstraction for knowledge-graph extraction.
//!
//! Defines the [`LlmClient`] trait and concrete implementations:
//! - **Ollama** — `POST {base}/api/generate` against a local instance.
//! - **OpenAI** — `POST /v1/chat/completions` with a bearer key.
//! - **Groq** — same wire format as OpenAI, different base URL.
//!
//! With `llm.provider = "disabled"` the factory yields `None` and graph
//! extraction is skipped entirely.
//!
//! # Retry Strategy
//!
//! All providers retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::LlmConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Extraction runs want deterministic output, not creative writing.
const TEMPERATURE: f64 = 0.1;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one prompt and returns the model's raw text completion.
    async fn generate(&self, prompt: &str) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// Builds the configured provider, or `None` when the LLM is disabled.
pub fn create_client(config: &LlmConfig) -> Result<Option<Box<dyn LlmClient>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "ollama" => Ok(Some(Box::new(OllamaClient::new(config)?))),
        "openai" => Ok(Some(Box::new(ChatCompletionsClient::new(
            config,
            OPENAI_BASE_URL,
            config.openai_model.clone(),
        )?))),
        "groq" => Ok(Some(Box::new(ChatCompletionsClient::new(
            config,
            GROQ_BASE_URL,
            config.groq_model.clone(),
        )?))),
        other => bail!("Unknown LLM provider: {}", other),
    }
}

/// POST a JSON body with retry/backoff, returning the parsed response JSON.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    warn!(%url, %status, attempt, "LLM request failed, will retry");
                    last_err = Some(anyhow::anyhow!("LLM API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("LLM API error {}: {}", status, body_text);
            }
            Err(e) => {
                warn!(%url, attempt, error = %e, "LLM request failed, will retry");
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM request failed after retries")))
}

// ============ Ollama ============

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.ollama_base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": TEMPERATURE },
        });

        let json = post_with_retry(&self.client, &url, None, &body, self.max_retries).await?;
        parse_ollama_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
}

// ============ OpenAI-compatible chat completions (OpenAI, Groq) ============

pub struct ChatCompletionsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl ChatCompletionsClient {
    pub fn new(config: &LlmConfig, base_url: &str, model: String) -> Result<Self> {
        let api_key = match config.api_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => bail!("llm.api_key required for provider '{}'", config.provider),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": TEMPERATURE,
        });

        let json = post_with_retry(
            &self.client,
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        parse_chat_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat completions response: missing content"))
}

// ============ Mock ============

/// Replays canned responses in order and records every prompt it sees.
#[cfg(test)]
pub struct MockLlmClient {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockLlmClient {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: std::sync::Mutex::new(
                responses.iter().map(|s| s.to_string()).collect(),
            ),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => Ok(response),
            None => bail!("mock has no responses left"),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_respects_provider() {
        let mut config = LlmConfig::default();
        config.provider = "disabled".to_string();
        assert!(create_client(&config).unwrap().is_none());

        config.provider = "ollama".to_string();
        let client = create_client(&config).unwrap().unwrap();
        assert_eq!(client.model_name(), config.model);

        config.provider = "openai".to_string();
        assert!(create_client(&config).is_err()); // no api key

        config.api_key = Some("sk-test".to_string());
        let client = create_client(&config).unwrap().unwrap();
        assert_eq!(client.model_name(), config.openai_model);

        config.provider = "groq".to_string();
        let client = create_client(&config).unwrap().unwrap();
        assert_eq!(client.model_name(), config.groq_model);

        config.provider = "bard".to_string();
        assert!(create_client(&config).is_err());
    }

    #[test]
    fn parses_ollama_and_chat_payloads() {
        let ollama = json!({ "model": "llama3.2", "response": "extracted text" });
        assert_eq!(parse_ollama_response(&ollama).unwrap(), "extracted text");
        assert!(parse_ollama_response(&json!({"done": true})).is_err());

        let chat = json!({
            "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
        });
        assert_eq!(parse_chat_response(&chat).unwrap(), "hello");
        assert!(parse_chat_response(&json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn mock_replays_in_order_and_records_prompts() {
        let mock = MockLlmClient::new(&["first", "second"]);
        assert_eq!(mock.generate("p1").await.unwrap(), "first");
        assert_eq!(mock.generate("p2").await.unwrap(), "second");
        assert!(mock.generate("p3").await.is_err());
        assert_eq!(mock.prompts(), vec!["p1", "p2", "p3"]);
    }
}
