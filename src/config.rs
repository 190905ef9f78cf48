//! Environment-backed configuration.
//!
//! Every delivery knob has a documented default; only the bot token and the
//! Gemini API key are required. Values are read once at startup — there is
//! no runtime reload.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

/// Telegram's hard per-message ceiling is 4096 characters; the default stays
/// under it to leave room for markup the transport may add.
const DEFAULT_MAX_PAYLOAD: usize = 4000;

/// Minimum interval between consecutive edits of the same message.
const DEFAULT_EDIT_INTERVAL_MS: u64 = 800;

/// Edits allowed per message before delivery rolls over to a fresh message.
const DEFAULT_MAX_EDITS_PER_MESSAGE: u32 = 30;

/// Requests allowed to queue behind an active delivery for the same chat.
const DEFAULT_MAX_QUEUE_DEPTH: usize = 2;

/// Total attempts per sink operation (first try plus retries).
const DEFAULT_SINK_ATTEMPTS: u32 = 3;

const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub db_path: PathBuf,
    pub debug: bool,
    pub delivery: DeliveryConfig,
}

/// Knobs consumed by the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum payload size per chunk committed to the transport.
    pub max_payload: usize,
    /// Minimum interval between consecutive operations on one message.
    pub edit_interval: Duration,
    /// Edit budget per message; exceeding it starts a new message.
    pub max_edits_per_message: u32,
    /// Bounded wait queue length per conversation; requests beyond it are
    /// rejected as busy instead of piling up.
    pub max_queue_depth: usize,
    /// Total sink attempts per operation for retryable failures.
    pub sink_attempts: u32,
    /// Base backoff between sink retries (doubled per attempt, jittered).
    pub retry_backoff: Duration,
    /// Overall deadline for one generation-to-delivery session.
    pub generation_timeout: Duration,
    /// Sent when the stream completes without producing any text.
    pub empty_fallback: String,
    /// Best-effort notice sent when delivery fails after partial output.
    pub failure_notice: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            edit_interval: Duration::from_millis(DEFAULT_EDIT_INTERVAL_MS),
            max_edits_per_message: DEFAULT_MAX_EDITS_PER_MESSAGE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            sink_attempts: DEFAULT_SINK_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            generation_timeout: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
            empty_fallback: "The model returned an empty answer. Try rephrasing the question."
                .to_string(),
            failure_notice: "Something went wrong while finishing this answer.".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment. `.env` loading is the
    /// caller's job (main calls `dotenvy` before this).
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_token = require("BOT_TOKEN")?;
        let gemini_api_key = require("GEMINI_API_KEY")?;
        let gemini_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string());
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./arcanum.db"));
        let debug = std::env::var("DEBUG")
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(false);

        let mut delivery = DeliveryConfig::default();
        if let Some(value) = parse_env::<usize>("ARCANUM_MAX_PAYLOAD")? {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: "ARCANUM_MAX_PAYLOAD",
                    reason: "must be greater than zero".to_string(),
                });
            }
            delivery.max_payload = value;
        }
        if let Some(value) = parse_env::<u64>("ARCANUM_EDIT_INTERVAL_MS")? {
            delivery.edit_interval = Duration::from_millis(value);
        }
        if let Some(value) = parse_env::<u32>("ARCANUM_MAX_EDITS_PER_MESSAGE")? {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: "ARCANUM_MAX_EDITS_PER_MESSAGE",
                    reason: "must be greater than zero".to_string(),
                });
            }
            delivery.max_edits_per_message = value;
        }
        if let Some(value) = parse_env::<usize>("ARCANUM_MAX_QUEUE_DEPTH")? {
            delivery.max_queue_depth = value;
        }
        if let Some(value) = parse_env::<u32>("ARCANUM_SINK_ATTEMPTS")? {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: "ARCANUM_SINK_ATTEMPTS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            delivery.sink_attempts = value;
        }
        if let Some(value) = parse_env::<u64>("ARCANUM_RETRY_BACKOFF_MS")? {
            delivery.retry_backoff = Duration::from_millis(value);
        }
        if let Some(value) = parse_env::<u64>("ARCANUM_GENERATION_TIMEOUT_SECS")? {
            delivery.generation_timeout = Duration::from_secs(value);
        }

        Ok(Self {
            telegram_token,
            gemini_api_key,
            gemini_model,
            db_path,
            debug,
            delivery,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_env<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|error| ConfigError::Invalid {
            key,
            reason: error.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_defaults_are_sane() {
        let config = DeliveryConfig::default();
        assert!(config.max_payload <= 4096);
        assert!(config.max_edits_per_message > 0);
        assert!(config.sink_attempts > 0);
    }
}
