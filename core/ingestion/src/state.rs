use anyhow::{Context, Result};
use jarvis_composer::{PromptRenderer, ReplySynthesizer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::buffer::BufferManager;
use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::database::Database;
use crate::guard::KeyGuard;
use crate::vault::KeyVault;
use crate::wake_word::WakeWordDetector;

/// Shared handles passed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub buffers: Arc<BufferManager>,
    pub wake_words: Arc<WakeWordDetector>,
    pub synthesizer: Arc<ReplySynthesizer>,
    pub vault: Arc<KeyVault>,
    pub guard: Arc<KeyGuard>,
    pub clock: Arc<dyn Clock>,
    pub started_at: f64,
}

impl AppState {
    /// Wire up the service from configuration and an opened database
    pub fn from_config(config: &ServiceConfig, db: Database) -> Result<Self> {
        let renderer = PromptRenderer::new(config.assistant_name.clone());
        let synthesizer =
            ReplySynthesizer::from_config(&config.providers, renderer, config.reply_failure_policy)?;

        let vault = match config.encryption_key {
            Some(ref key) => KeyVault::from_base64(key).context("Invalid JARVIS_ENCRYPTION_KEY")?,
            None => {
                warn!(
                    "JARVIS_ENCRYPTION_KEY not set; using an ephemeral key. \
                     Stored OMI keys will be unreadable after a restart."
                );
                KeyVault::ephemeral()
            }
        };

        let wake_words = WakeWordDetector::for_assistant(&config.assistant_name, &config.wake_words)?;

        Ok(Self::assemble(config, db, wake_words, synthesizer, vault, Arc::new(SystemClock)))
    }

    /// Assemble state from prebuilt parts. Tests use this to inject a
    /// manual clock and a scripted synthesizer.
    pub fn assemble(
        config: &ServiceConfig,
        db: Database,
        wake_words: WakeWordDetector,
        synthesizer: ReplySynthesizer,
        vault: KeyVault,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            db: Arc::new(Mutex::new(db)),
            buffers: Arc::new(BufferManager::new(config.buffer.clone())),
            wake_words: Arc::new(wake_words),
            synthesizer: Arc::new(synthesizer),
            vault: Arc::new(vault),
            guard: Arc::new(KeyGuard::new(config.guard)),
            clock,
            started_at,
        }
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}
