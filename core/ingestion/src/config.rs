use anyhow::{bail, Context, Result};
use jarvis_composer::{ProviderConfig, ReplyFailurePolicy};
use std::path::PathBuf;
use std::str::FromStr;

use crate::buffer::BufferConfig;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:21953";

/// Background cleanup cadence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Persisted rows whose last activity is older than this are deleted
    pub row_retention_secs: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            row_retention_secs: 86_400.0,
        }
    }
}

/// CSRF and lockout limits for the OMI key endpoints
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardConfig {
    pub csrf_ttl_secs: f64,
    pub max_failures: usize,
    pub failure_window_secs: f64,
    pub lockout_secs: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            csrf_ttl_secs: 3_600.0,
            max_failures: 5,
            failure_window_secs: 900.0,
            lockout_secs: 900.0,
        }
    }
}

/// Everything the service reads from its environment
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub buffer: BufferConfig,
    pub assistant_name: String,
    /// Extra wake-word spellings on top of the assistant name
    pub wake_words: Vec<String>,
    pub reply_failure_policy: ReplyFailurePolicy,
    /// Base64 AES-256 key; absent means an ephemeral key
    pub encryption_key: Option<String>,
    pub providers: ProviderConfig,
    pub sweep: SweepConfig,
    pub guard: GuardConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = match lookup("DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path(lookup("HOME")),
        };

        let defaults = BufferConfig::default();
        let buffer = BufferConfig {
            silence_threshold_secs: parse_or(
                lookup("JARVIS_SILENCE_THRESHOLD_SECS"),
                "JARVIS_SILENCE_THRESHOLD_SECS",
                defaults.silence_threshold_secs,
            )?,
            analysis_interval_secs: parse_or(
                lookup("JARVIS_ANALYSIS_INTERVAL_SECS"),
                "JARVIS_ANALYSIS_INTERVAL_SECS",
                defaults.analysis_interval_secs,
            )?,
            min_words_after_silence: parse_or(
                lookup("JARVIS_MIN_WORDS_AFTER_SILENCE"),
                "JARVIS_MIN_WORDS_AFTER_SILENCE",
                defaults.min_words_after_silence,
            )?,
            ..defaults
        };
        if buffer.silence_threshold_secs <= 0.0 || buffer.analysis_interval_secs <= 0.0 {
            bail!("buffer thresholds must be positive");
        }

        let reply_failure_policy = match lookup("JARVIS_REPLY_FAILURE_POLICY") {
            Some(raw) => ReplyFailurePolicy::from_str(&raw).map_err(anyhow::Error::msg)?,
            None => ReplyFailurePolicy::default(),
        };

        let wake_words = lookup("JARVIS_WAKE_WORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|w| w.trim().to_string())
                    .filter(|w| !w.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            db_path,
            bind_addr: lookup("JARVIS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            buffer,
            assistant_name: lookup("JARVIS_ASSISTANT_NAME").unwrap_or_else(|| "Jarvis".to_string()),
            wake_words,
            reply_failure_policy,
            encryption_key: lookup("JARVIS_ENCRYPTION_KEY"),
            providers: ProviderConfig::from_lookup(lookup),
            sweep: SweepConfig::default(),
            guard: GuardConfig::default(),
        })
    }
}

fn default_db_path(home: Option<String>) -> PathBuf {
    match home {
        Some(home) => PathBuf::from(home).join(".local/share/jarvis/jarvis.db"),
        None => PathBuf::from("jarvis.db"),
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, raw)),
        None => Ok(default),
    }
}
