//! Chat-completion providers tried, in order, by the reply synthesizer.
//!
//! Three wire formats are supported: an Ollama-style local endpoint, any
//! OpenAI-compatible `/v1/chat/completions` endpoint, and the Anthropic
//! messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {provider} failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} returned no reply text")]
    Empty { provider: &'static str },
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, ProviderError>;
}

/// Endpoint settings for a single provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Configuration for the provider chain. A provider is only tried when its
/// endpoint is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub local: Option<EndpointConfig>,
    pub generic: Option<EndpointConfig>,
    pub commercial: Option<EndpointConfig>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            local: None,
            generic: None,
            commercial: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ProviderConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let local = lookup("OLLAMA_URL").map(|base_url| EndpointConfig {
            base_url: trim_base(base_url),
            api_key: None,
            model: lookup("OLLAMA_MODEL").unwrap_or_else(|| "llama3.2:3b".to_string()),
        });

        // A base URL alone is enough for keyless OpenAI-compatible servers
        let generic_key = lookup("OPENAI_API_KEY");
        let generic_url = lookup("OPENAI_BASE_URL");
        let generic = if generic_key.is_some() || generic_url.is_some() {
            Some(EndpointConfig {
                base_url: trim_base(
                    generic_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
                ),
                api_key: generic_key,
                model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            })
        } else {
            None
        };

        let commercial = lookup("ANTHROPIC_API_KEY").map(|api_key| EndpointConfig {
            base_url: trim_base(
                lookup("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            ),
            api_key: Some(api_key),
            model: lookup("ANTHROPIC_MODEL")
                .unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
        });

        let timeout_secs = lookup("LLM_TIMEOUT_SECS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            local,
            generic,
            commercial,
            timeout_secs,
        }
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            provider,
            status,
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|source| ProviderError::Transport { provider, source })
}

fn non_empty(provider: &'static str, text: Option<String>) -> Result<String, ProviderError> {
    match text {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(ProviderError::Empty { provider }),
    }
}

// ========== LOCAL (OLLAMA) ==========

pub struct OllamaProvider {
    client: Client,
    config: EndpointConfig,
}

impl OllamaProvider {
    pub fn new(client: Client, config: EndpointConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, ProviderError> {
        let url = format!("{}/api/chat", self.config.base_url);

        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(turns.iter().map(|t| json!(t)));

        let request_body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
        });

        debug!("Calling Ollama at {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.name(),
                source,
            })?;

        #[derive(Deserialize)]
        struct OllamaResponse {
            message: Option<OllamaMessage>,
        }

        #[derive(Deserialize)]
        struct OllamaMessage {
            content: String,
        }

        let parsed: OllamaResponse = read_json(self.name(), response).await?;
        non_empty(self.name(), parsed.message.map(|m| m.content))
    }
}

// ========== GENERIC (OPENAI-COMPATIBLE) ==========

pub struct OpenAiProvider {
    client: Client,
    config: EndpointConfig,
}

impl OpenAiProvider {
    pub fn new(client: Client, config: EndpointConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(turns.iter().map(|t| json!(t)));

        let request_body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.7,
            "max_tokens": 300,
        });

        debug!("Calling OpenAI-compatible endpoint at {}", url);

        let mut request = self.client.post(&url).json(&request_body);
        if let Some(ref api_key) = self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.name(),
                source,
            })?;

        #[derive(Deserialize)]
        struct OpenAIResponse {
            choices: Vec<OpenAIChoice>,
        }

        #[derive(Deserialize)]
        struct OpenAIChoice {
            message: OpenAIMessage,
        }

        #[derive(Deserialize)]
        struct OpenAIMessage {
            content: Option<String>,
        }

        let parsed: OpenAIResponse = read_json(self.name(), response).await?;
        non_empty(
            self.name(),
            parsed.choices.into_iter().next().and_then(|c| c.message.content),
        )
    }
}

// ========== COMMERCIAL (ANTHROPIC) ==========

pub struct AnthropicProvider {
    client: Client,
    config: EndpointConfig,
}

impl AnthropicProvider {
    pub fn new(client: Client, config: EndpointConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let request_body = json!({
            "model": self.config.model,
            "system": system,
            "messages": turns,
            "max_tokens": 300,
        });

        debug!("Calling Anthropic at {}", url);

        let mut request = self
            .client
            .post(&url)
            .header("anthropic-version", "2023-06-01")
            .json(&request_body);
        if let Some(ref api_key) = self.config.api_key {
            request = request.header("x-api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: self.name(),
                source,
            })?;

        #[derive(Deserialize)]
        struct AnthropicResponse {
            content: Vec<AnthropicBlock>,
        }

        #[derive(Deserialize)]
        struct AnthropicBlock {
            text: Option<String>,
        }

        let parsed: AnthropicResponse = read_json(self.name(), response).await?;
        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        non_empty(self.name(), Some(text))
    }
}
