use anyhow::{Context, Result};
use jarvis_schemas::BufferedMessage;
use reqwest::Client;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::providers::{
    AnthropicProvider, ChatProvider, ChatRole, ChatTurn, OllamaProvider, OpenAiProvider,
    ProviderConfig,
};
use crate::templates::PromptRenderer;

/// Number of trailing messages forwarded to a provider
pub const HISTORY_WINDOW: usize = 10;

/// What to do when every provider in the chain fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFailurePolicy {
    /// Answer with a canned reply and mark it degraded
    #[default]
    Fallback,
    /// Surface the failure to the caller
    Error,
}

impl FromStr for ReplyFailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "fallback" => Ok(ReplyFailurePolicy::Fallback),
            "error" => Ok(ReplyFailurePolicy::Error),
            other => Err(format!("unknown reply failure policy: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no reply providers are configured")]
    NoProviders,

    #[error("all {attempted} reply providers failed")]
    AllProvidersFailed { attempted: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub provider: Option<&'static str>,
    pub degraded: bool,
}

/// Turns a buffered conversation into an assistant reply by walking the
/// provider chain until one answers.
pub struct ReplySynthesizer {
    providers: Vec<Box<dyn ChatProvider>>,
    renderer: PromptRenderer,
    policy: ReplyFailurePolicy,
}

impl ReplySynthesizer {
    pub fn new(
        providers: Vec<Box<dyn ChatProvider>>,
        renderer: PromptRenderer,
        policy: ReplyFailurePolicy,
    ) -> Self {
        Self {
            providers,
            renderer,
            policy,
        }
    }

    /// Build the local → generic → commercial chain from configuration
    pub fn from_config(
        config: &ProviderConfig,
        renderer: PromptRenderer,
        policy: ReplyFailurePolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build chat-completion HTTP client")?;

        let mut providers: Vec<Box<dyn ChatProvider>> = Vec::new();
        if let Some(ref local) = config.local {
            providers.push(Box::new(OllamaProvider::new(client.clone(), local.clone())));
        }
        if let Some(ref generic) = config.generic {
            providers.push(Box::new(OpenAiProvider::new(client.clone(), generic.clone())));
        }
        if let Some(ref commercial) = config.commercial {
            providers.push(Box::new(AnthropicProvider::new(client, commercial.clone())));
        }

        info!(
            "Reply synthesizer configured with {} provider(s), policy {:?}",
            providers.len(),
            policy
        );

        Ok(Self::new(providers, renderer, policy))
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn renderer(&self) -> &PromptRenderer {
        &self.renderer
    }

    pub async fn synthesize(
        &self,
        history: &[BufferedMessage],
        salutation: &str,
    ) -> Result<Reply, SynthesisError> {
        let system = self.renderer.persona_system_prompt(salutation);
        let turns = history_window(history);

        for provider in &self.providers {
            match provider.complete(&system, &turns).await {
                Ok(text) => {
                    info!("Reply generated by {}", provider.name());
                    return Ok(Reply {
                        text,
                        provider: Some(provider.name()),
                        degraded: false,
                    });
                }
                Err(e) => {
                    warn!("Reply provider {} failed: {}", provider.name(), e);
                }
            }
        }

        let err = if self.providers.is_empty() {
            SynthesisError::NoProviders
        } else {
            SynthesisError::AllProvidersFailed {
                attempted: self.providers.len(),
            }
        };

        match self.policy {
            ReplyFailurePolicy::Fallback => {
                warn!("{}; answering with fallback reply", err);
                Ok(Reply {
                    text: self.renderer.fallback_reply(salutation),
                    provider: None,
                    degraded: true,
                })
            }
            ReplyFailurePolicy::Error => Err(err),
        }
    }
}

/// Last [`HISTORY_WINDOW`] messages as provider turns
pub fn history_window(history: &[BufferedMessage]) -> Vec<ChatTurn> {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|m| ChatTurn {
            role: if m.is_user {
                ChatRole::User
            } else {
                ChatRole::Assistant
            },
            content: m.text.clone(),
        })
        .collect()
}
